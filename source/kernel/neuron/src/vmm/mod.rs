// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap-and-emulate of RISC-V privileged instructions for guest processes
//! OWNERS: @kernel-vmm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per submodule, scenario tests (tests.rs), properties (tests_prop.rs)
//! PUBLIC API: VmManager, VmContext, Outcome, install/trap_and_emulate/trap_and_emulate_init
//! DEPENDS_ON: task::Process, mm::PageTable, trap::TrapFrame, arch::riscv
//! INVARIANTS: One context per PID; a violation kills the guest and resets its context;
//!             internal faults propagate and are never masked
//!
//! A guest runs in real U-mode while believing it owns the S- and M-mode
//! state of a hart. Every privileged instruction it executes traps here and
//! is emulated against its [`VmContext`]:
//!
//! - ECALL/SRET/MRET move the virtual privilege mode (see [`mode`]).
//! - CSR instructions go through the [`mediator`], which enforces each
//!   register's minimum mode.
//! - On the first trap the guest's page table is copied into a shadow table.
//!   Once PMP registers are written, every successful MRET builds a
//!   restricted copy of the shadow with the PMP-denied regions unmapped and
//!   makes it the guest's live table.

pub mod context;
pub mod csr;
pub mod decode;
pub mod error;
pub mod mediator;
pub mod mode;
pub mod pmp;
pub mod shadow;

#[cfg(test)]
mod tests_prop;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use spin::Mutex;
use static_assertions::assert_impl_all;

use crate::{
    config::VmmConfig,
    log_error, log_info, log_warn,
    mm::PageTable,
    task::{Process, ProcessTable},
    types::Pid,
};

pub use context::VmContext;
pub use csr::{PrivilegeMode, RegisterFile, VirtualRegister};
pub use error::{Violation, VmmFault};

use decode::{Fields, Instruction, Operand};

/// Result of emulating one trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The guest resumes at its (updated) `sepc`.
    Resumed,
    /// The guest broke the protocol; it was killed and its context reset.
    Terminated(Violation),
}

enum Abort {
    Guest(Violation),
    Kernel(VmmFault),
}

impl From<Violation> for Abort {
    fn from(value: Violation) -> Self {
        Self::Guest(value)
    }
}

impl From<VmmFault> for Abort {
    fn from(value: VmmFault) -> Self {
        Self::Kernel(value)
    }
}

/// Owner of every guest's virtual privileged state.
#[derive(Debug)]
pub struct VmManager {
    config: VmmConfig,
    contexts: BTreeMap<Pid, VmContext>,
}

assert_impl_all!(VmManager: Send);

impl VmManager {
    pub const fn new(config: VmmConfig) -> Self {
        Self { config, contexts: BTreeMap::new() }
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    /// Read-only view of a guest's context.
    pub fn context(&self, pid: Pid) -> Option<&VmContext> {
        self.contexts.get(&pid)
    }

    /// Puts `pid`'s context into its initial state, creating it if needed.
    pub fn init(&mut self, pid: Pid) {
        let config = self.config;
        self.contexts
            .entry(pid)
            .and_modify(|ctx| ctx.reset(&config))
            .or_insert_with(|| VmContext::new(&config));
    }

    /// Drops the context of an exiting process. Returns whether one existed.
    pub fn on_process_exit(&mut self, pid: Pid) -> bool {
        self.contexts.remove(&pid).is_some()
    }

    /// Removes `pid` from `processes` together with its context.
    pub fn exit_process(&mut self, processes: &mut ProcessTable, pid: Pid) -> Option<Process> {
        self.on_process_exit(pid);
        processes.exit(pid)
    }

    /// Emulates the privileged instruction at `process.frame().sepc`.
    ///
    /// Guest violations are absorbed: the process is killed, its context reset
    /// and [`Outcome::Terminated`] returned. Only internal faults surface as `Err`.
    pub fn trap_and_emulate(&mut self, process: &mut Process) -> Result<Outcome, VmmFault> {
        let config = self.config;
        let pid = process.pid();
        let ctx = self.contexts.entry(pid).or_insert_with(|| VmContext::new(&config));
        match emulate(ctx, process, &config) {
            Ok(()) => {
                #[cfg(feature = "trace_emulation")]
                dump_registers(pid, ctx);
                Ok(Outcome::Resumed)
            }
            Err(Abort::Guest(violation)) => {
                terminate(ctx, process, violation, &config);
                Ok(Outcome::Terminated(violation))
            }
            Err(Abort::Kernel(fault)) => {
                log_error!(target: "vmm", "pid {}: {}", pid, fault);
                Err(fault)
            }
        }
    }
}

fn emulate(ctx: &mut VmContext, process: &mut Process, config: &VmmConfig) -> Result<(), Abort> {
    let shadow = match &ctx.shadow {
        Some(shadow) => Arc::clone(shadow),
        None => {
            let shadow = Arc::new(shadow::build_shadow(process.table(), process.size(), config)?);
            ctx.shadow = Some(Arc::clone(&shadow));
            shadow
        }
    };

    let pc = process.frame().sepc;
    let fields = Fields::parse(decode::fetch(process.live_table(), pc)?);
    let instruction = decode::classify(fields);
    if instruction == Ok(Instruction::Ecall) {
        log_info!(target: "vmm", "pid {}: (EC at {:#x})", process.pid(), pc);
    } else {
        log_info!(
            target: "vmm",
            "pid {}: (PI at {:#x}) op = {:x}, rd = {:x}, funct3 = {:x}, rs1 = {:x}, uimm = {:x}",
            process.pid(),
            pc,
            fields.opcode,
            fields.rd,
            fields.funct3,
            fields.rs1,
            fields.imm
        );
    }

    match instruction? {
        Instruction::Ecall => {
            let from = ctx.mode;
            let next = mode::ecall(ctx, pc as u64)?;
            if from == PrivilegeMode::Supervisor {
                process.set_live_table(shadow);
            }
            process.frame_mut().sepc = next as usize;
        }
        Instruction::Sret => {
            let next = mode::sret(ctx)?;
            process.frame_mut().sepc = next as usize;
        }
        Instruction::Mret => {
            // A failed build must leave mode and mstatus as they were.
            let restricted = if ctx.pmp_configured {
                Some(restricted_table(ctx, &shadow, process, config)?)
            } else {
                None
            };
            let next = mode::mret(ctx)?;
            if let Some(table) = restricted {
                process.set_live_table(Arc::clone(&table));
                ctx.restricted = Some(table);
            }
            process.frame_mut().sepc = next as usize;
        }
        insn @ Instruction::Csr { op, csr, rd, src } => {
            let frame = process.frame_mut();
            match src {
                Operand::Register(rs1) if insn.is_plain_write() => {
                    mediator::write_from(ctx, frame, csr, rs1)?
                }
                _ if insn.is_plain_read() => mediator::read_into(ctx, frame, csr, rd)?,
                _ => mediator::execute(ctx, frame, op, csr, rd, src)?,
            }
            frame.sepc = frame.sepc.wrapping_add(4);
        }
    }
    Ok(())
}

fn restricted_table(
    ctx: &VmContext,
    shadow: &PageTable,
    process: &Process,
    config: &VmmConfig,
) -> Result<Arc<PageTable>, VmmFault> {
    let registers = &ctx.registers;
    let addrs: Vec<u64> = csr::PMPADDR
        .iter()
        .take(config.pmp_entries)
        .map(|&code| registers.value(code).unwrap_or(0))
        .collect();
    let cfg = registers.value(csr::PMPCFG0).unwrap_or(0);
    let regions = pmp::pmp_regions(&addrs, cfg, config.memory_base);

    let restricted = shadow::build_restricted(shadow, process.size(), config, &regions)?;
    log_info!(
        target: "vmm-pt",
        "pid {}: restricted table built ({} regions)",
        process.pid(),
        regions.len()
    );
    Ok(Arc::new(restricted))
}

/// Kills the guest and returns its context to the initial state.
fn terminate(ctx: &mut VmContext, process: &mut Process, violation: Violation, config: &VmmConfig) {
    log_warn!(
        target: "vmm",
        "pid {}: {} at {:#x} in {}; terminating guest",
        process.pid(),
        violation,
        process.frame().sepc,
        ctx.mode
    );
    if let Some(shadow) = ctx.shadow.take() {
        process.set_live_table(shadow);
    }
    process.kill();
    ctx.reset(config);
}

#[cfg(feature = "trace_emulation")]
fn dump_registers(pid: Pid, ctx: &VmContext) {
    log_info!(target: "vmm-csr", "pid {}: mode {}", pid, ctx.mode);
    for reg in ctx.registers.iter() {
        log_info!(target: "vmm-csr", "pid {}: {:#05x} = {:#x}", pid, reg.code, reg.value);
    }
}

// ——— kernel-wide instance ———

static MANAGER: Mutex<Option<VmManager>> = Mutex::new(None);

/// Installs the kernel-wide manager, discarding any previous one.
pub fn install(config: VmmConfig) {
    *MANAGER.lock() = Some(VmManager::new(config));
}

/// Runs `f` on the kernel-wide manager, creating it with the default layout on first use.
/// The lock is held for the whole call.
pub fn with_manager<R>(f: impl FnOnce(&mut VmManager) -> R) -> R {
    let mut guard = MANAGER.lock();
    let manager = guard.get_or_insert_with(|| VmManager::new(VmmConfig::DEFAULT));
    f(manager)
}

/// Trap-path entry for an illegal-instruction or ECALL exception of a guest.
pub fn trap_and_emulate(process: &mut Process) -> Result<Outcome, VmmFault> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        process.frame_mut().sepc = crate::arch::riscv::read_sepc();
    }
    with_manager(|manager| manager.trap_and_emulate(process))
}

/// Resets (or creates) the context of `pid`.
pub fn trap_and_emulate_init(pid: Pid) {
    with_manager(|manager| manager.init(pid));
}

/// Releases the context of an exiting process.
pub fn on_process_exit(pid: Pid) -> bool {
    with_manager(|manager| manager.on_process_exit(pid))
}

/// Process exit path: drops `pid` from `processes` and releases its context.
pub fn exit_process(processes: &mut ProcessTable, pid: Pid) -> Option<Process> {
    with_manager(|manager| manager.exit_process(processes, pid))
}
