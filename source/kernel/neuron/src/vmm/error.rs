// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the emulator.
//!
//! [`Violation`]s are guest misbehavior and end in termination of the guest.
//! [`VmmFault`]s mean the kernel's own view of the guest is inconsistent and
//! are never recovered from.

use crate::mm::MapError;

use super::{csr::PrivilegeMode, mode::Transition};

/// Guest protocol violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// Access to a CSR that is not part of the virtual register file.
    #[error("unknown csr {csr:#05x}")]
    UnknownRegister { csr: u16 },
    /// Access to a CSR from a mode below its minimum mode.
    #[error("csr {csr:#05x} requires {required}, guest is in {current}")]
    InsufficientPrivilege { csr: u16, required: PrivilegeMode, current: PrivilegeMode },
    /// ECALL in M, SRET outside S or MRET in U.
    #[error("{transition} not allowed in {mode}")]
    InvalidTransition { transition: Transition, mode: PrivilegeMode },
    /// A trapping instruction the emulator does not model.
    #[error("unsupported privileged instruction {word:#010x}")]
    UnsupportedInstruction { word: u32 },
}

/// Internal emulator fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VmmFault {
    /// A page the guest must be able to reach has no valid leaf entry.
    #[error("no valid mapping for guest address {va:#x}")]
    InconsistentMapping { va: usize },
    /// The trap PC is not 4-byte aligned or not canonical.
    #[error("misaligned guest pc {pc:#x}")]
    MisalignedFetch { pc: usize },
    /// Building a shadow or restricted table failed.
    #[error("page-table construction failed: {0}")]
    Map(#[from] MapError),
}
