// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Privilege-mode state machine: ECALL, SRET and MRET on virtual state.
//!
//! Each transition returns the guest PC to resume at. Page-table side
//! effects are left to the caller.

use core::fmt;

use bitflags::bitflags;

use super::{
    context::VmContext,
    csr::{self, PrivilegeMode},
    error::Violation,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Trap-entry/return bits of `sstatus`.
    pub struct Sstatus: u64 {
        const SIE = 1 << 1;
        const SPIE = 1 << 5;
        const SPP = 1 << 8;
        const _ = !0;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Trap-entry/return bits of `mstatus`.
    pub struct Mstatus: u64 {
        const MIE = 1 << 3;
        const MPIE = 1 << 7;
        const MPP = 0b11 << 11;
        const _ = !0;
    }
}

const MPP_SHIFT: u32 = 11;

impl Mstatus {
    /// Raw two-bit MPP field.
    pub const fn mpp(self) -> u64 {
        (self.bits() & Self::MPP.bits()) >> MPP_SHIFT
    }

    pub fn with_mpp(self, mode: PrivilegeMode) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MPP.bits()) | (mode.mpp_bits() << MPP_SHIFT))
    }
}

/// Mode-changing instruction, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Ecall,
    Sret,
    Mret,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ecall => "ecall",
            Self::Sret => "sret",
            Self::Mret => "mret",
        })
    }
}

fn value(ctx: &VmContext, code: u16) -> Result<u64, Violation> {
    ctx.registers.value(code).ok_or(Violation::UnknownRegister { csr: code })
}

fn store(ctx: &mut VmContext, code: u16, value: u64) -> Result<(), Violation> {
    let reg = ctx.registers.lookup(code).ok_or(Violation::UnknownRegister { csr: code })?;
    reg.value = value;
    Ok(())
}

/// ECALL from U enters virtual S, from S enters virtual M; from M it is invalid.
pub fn ecall(ctx: &mut VmContext, pc: u64) -> Result<u64, Violation> {
    match ctx.mode {
        PrivilegeMode::User => {
            let mut status = Sstatus::from_bits_retain(value(ctx, csr::SSTATUS)?);
            let handler = value(ctx, csr::STVEC)?;
            status.set(Sstatus::SPIE, status.contains(Sstatus::SIE));
            status.remove(Sstatus::SIE | Sstatus::SPP);
            store(ctx, csr::SEPC, pc)?;
            store(ctx, csr::SSTATUS, status.bits())?;
            ctx.mode = PrivilegeMode::Supervisor;
            Ok(handler)
        }
        PrivilegeMode::Supervisor => {
            let mut status = Mstatus::from_bits_retain(value(ctx, csr::MSTATUS)?);
            let handler = value(ctx, csr::MTVEC)?;
            status.set(Mstatus::MPIE, status.contains(Mstatus::MIE));
            status.remove(Mstatus::MIE);
            let status = status.with_mpp(PrivilegeMode::Supervisor);
            store(ctx, csr::MEPC, pc)?;
            store(ctx, csr::MSTATUS, status.bits())?;
            ctx.mode = PrivilegeMode::Machine;
            Ok(handler)
        }
        PrivilegeMode::Machine => {
            Err(Violation::InvalidTransition { transition: Transition::Ecall, mode: ctx.mode })
        }
    }
}

/// SRET, valid only in virtual S. Demotes to U when `sstatus.SPP` is clear.
pub fn sret(ctx: &mut VmContext) -> Result<u64, Violation> {
    if ctx.mode != PrivilegeMode::Supervisor {
        return Err(Violation::InvalidTransition { transition: Transition::Sret, mode: ctx.mode });
    }
    let mut status = Sstatus::from_bits_retain(value(ctx, csr::SSTATUS)?);
    let target = value(ctx, csr::SEPC)?;
    let previous =
        if status.contains(Sstatus::SPP) { PrivilegeMode::Supervisor } else { PrivilegeMode::User };
    status.set(Sstatus::SIE, status.contains(Sstatus::SPIE));
    status.insert(Sstatus::SPIE);
    status.remove(Sstatus::SPP);
    store(ctx, csr::SSTATUS, status.bits())?;
    if previous == PrivilegeMode::User {
        ctx.mode = PrivilegeMode::User;
    }
    Ok(target)
}

/// MRET, valid in virtual S and M. Demotes to `mstatus.MPP` when it names U or S.
pub fn mret(ctx: &mut VmContext) -> Result<u64, Violation> {
    if ctx.mode < PrivilegeMode::Supervisor {
        return Err(Violation::InvalidTransition { transition: Transition::Mret, mode: ctx.mode });
    }
    let mut status = Mstatus::from_bits_retain(value(ctx, csr::MSTATUS)?);
    let target = value(ctx, csr::MEPC)?;
    let previous = PrivilegeMode::from_mpp(status.mpp());
    status.set(Mstatus::MIE, status.contains(Mstatus::MPIE));
    status.insert(Mstatus::MPIE);
    let status = status.with_mpp(PrivilegeMode::User);
    store(ctx, csr::MSTATUS, status.bits())?;
    if let Some(mode) = previous.filter(|mode| *mode < PrivilegeMode::Machine) {
        ctx.mode = mode;
    }
    Ok(target)
}
