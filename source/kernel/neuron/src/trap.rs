// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap handling: saved register state, diagnostics ring and routing of
//! privileged-instruction exceptions into the emulator.

use core::fmt::{self, Write};
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::{
    log_error,
    task::Process,
    vmm::{Outcome, VmManager, VmmFault},
};

// ——— diagnostics ———

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

const TRAP_RING_LEN: usize = 64;
static TRAP_RING: Mutex<TrapRing> = Mutex::new(TrapRing::new());

struct TrapRing {
    frames: [Option<TrapFrame>; TRAP_RING_LEN],
    next: usize,
}

impl TrapRing {
    const fn new() -> Self {
        Self { frames: [None; TRAP_RING_LEN], next: 0 }
    }
}

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

/// Exception code of an illegal instruction.
pub const ILLEGAL_INSTRUCTION: usize = 2;
/// Exception code of an `ecall` issued from U-mode.
pub const ECALL_FROM_U: usize = 8;

// ——— trap frame ———

/// Saved register state for an S-mode trap.
/// Layout matches the assembly trap vector's save/restore order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * core::mem::size_of::<usize>());

impl TrapFrame {
    /// Reads general-purpose register `index`; `x0` and out-of-range indices read as zero.
    #[inline]
    pub fn reg(&self, index: usize) -> usize {
        match index {
            1..=31 => self.x[index],
            _ => 0,
        }
    }

    /// Writes general-purpose register `rd`; writes to `x0` are discarded.
    #[inline]
    pub fn set_x(&mut self, rd: usize, value: usize) {
        if (1..32).contains(&rd) {
            self.x[rd] = value;
        }
    }
}

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
    let mut ring = TRAP_RING.lock();
    let slot = ring.next;
    ring.frames[slot] = Some(*frame);
    ring.next = (slot + 1) % TRAP_RING_LEN;
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

/// Returns up to `TRAP_RING_LEN` recorded frames, oldest first.
pub fn recent_traps() -> alloc::vec::Vec<TrapFrame> {
    let ring = TRAP_RING.lock();
    (0..TRAP_RING_LEN).filter_map(|i| ring.frames[(ring.next + i) % TRAP_RING_LEN]).collect()
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

// ——— exception routing ———

/// What the trap path did with an exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The emulator consumed the trap.
    Emulated(Outcome),
    /// Not ours: interrupts, other exception codes or non-virtualized processes.
    Unhandled,
}

/// Routes an exception raised by `process` to the emulator when it is a
/// privileged-instruction trap of a virtualized process.
pub fn handle_exception(
    process: &mut Process,
    manager: &mut VmManager,
) -> Result<Disposition, VmmFault> {
    let frame = *process.frame();
    record(&frame);
    if is_interrupt(frame.scause) || !process.is_virtualized() {
        return Ok(Disposition::Unhandled);
    }
    match frame.scause {
        ILLEGAL_INSTRUCTION | ECALL_FROM_U => {
            manager.trap_and_emulate(process).map(Disposition::Emulated)
        }
        _ => Ok(Disposition::Unhandled),
    }
}

/// Trap-vector entry: like [`handle_exception`] against the kernel-wide
/// manager, with internal emulator faults treated as fatal.
pub fn dispatch_exception(process: &mut Process) -> Disposition {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        process.frame_mut().sepc = crate::arch::riscv::read_sepc();
    }
    match crate::vmm::with_manager(|manager| handle_exception(process, manager)) {
        Ok(disposition) => disposition,
        Err(fault) => {
            log_error!(target: "trap", "pid {}: unrecoverable emulation fault: {}", process.pid(), fault);
            let mut dump = alloc::string::String::new();
            let _ = fmt_trap(process.frame(), &mut dump);
            log_error!(target: "trap", "{}", dump);
            panic!("emulation fault: {fault}");
        }
    }
}
