// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual CSR file of one guest
//! OWNERS: @kernel-vmm-team
//! PUBLIC API: PrivilegeMode, VirtualRegister, RegisterFile, CSR numbers
//! INVARIANTS: Exactly the registers of `REGISTERS` exist; lookups are exact matches

use alloc::collections::BTreeMap;
use core::fmt;

use crate::config::VmmConfig;

/// Privilege level of the virtual hart. Ordered `User < Supervisor < Machine`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 2,
}

impl PrivilegeMode {
    /// Decodes a two-bit `mstatus.MPP` field. Encoding 2 is reserved.
    pub const fn from_mpp(bits: u64) -> Option<Self> {
        match bits & 0b11 {
            0 => Some(Self::User),
            1 => Some(Self::Supervisor),
            3 => Some(Self::Machine),
            _ => None,
        }
    }

    /// Hardware encoding used in `mstatus.MPP`.
    pub const fn mpp_bits(self) -> u64 {
        match self {
            Self::User => 0,
            Self::Supervisor => 1,
            Self::Machine => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "U-mode",
            Self::Supervisor => "S-mode",
            Self::Machine => "M-mode",
        }
    }
}

impl fmt::Display for PrivilegeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Supervisor trap setup.
pub const SSTATUS: u16 = 0x100;
pub const SIE: u16 = 0x104;
pub const STVEC: u16 = 0x105;
pub const SCOUNTEREN: u16 = 0x106;
// Supervisor trap handling.
pub const SSCRATCH: u16 = 0x140;
pub const SEPC: u16 = 0x141;
pub const SCAUSE: u16 = 0x142;
pub const STVAL: u16 = 0x143;
pub const SIP: u16 = 0x144;
// Supervisor paging.
pub const SATP: u16 = 0x180;
// Machine information.
pub const MVENDORID: u16 = 0xf11;
pub const MARCHID: u16 = 0xf12;
pub const MIMPID: u16 = 0xf13;
pub const MHARTID: u16 = 0xf14;
pub const MCONFIGPTR: u16 = 0xf15;
// Machine trap setup.
pub const MSTATUS: u16 = 0x300;
pub const MISA: u16 = 0x301;
pub const MEDELEG: u16 = 0x302;
pub const MIDELEG: u16 = 0x303;
pub const MIE: u16 = 0x304;
pub const MTVEC: u16 = 0x305;
pub const MCOUNTEREN: u16 = 0x306;
pub const MSTATUSH: u16 = 0x310;
// Machine trap handling.
pub const MSCRATCH: u16 = 0x340;
pub const MEPC: u16 = 0x341;
pub const MCAUSE: u16 = 0x342;
pub const MTVAL: u16 = 0x343;
pub const MIP: u16 = 0x344;
pub const MTINST: u16 = 0x34a;
pub const MTVAL2: u16 = 0x34b;
// Physical memory protection.
pub const PMPCFG0: u16 = 0x3a0;
pub const PMPADDR0: u16 = 0x3b0;
pub const PMPADDR1: u16 = 0x3b1;
pub const PMPADDR2: u16 = 0x3b2;
pub const PMPADDR3: u16 = 0x3b3;

/// `pmpaddr` registers in entry order.
pub const PMPADDR: [u16; 4] = [PMPADDR0, PMPADDR1, PMPADDR2, PMPADDR3];

use self::PrivilegeMode::{Machine as M, Supervisor as S, User as U};

/// Every emulated register with its minimum access mode.
///
/// The PMP registers are reachable from U so a guest kernel can program them
/// from virtual S-mode before it drops to user code with MRET.
pub const REGISTERS: [(u16, PrivilegeMode); 35] = [
    (SSTATUS, S),
    (SIE, S),
    (STVEC, S),
    (SCOUNTEREN, S),
    (SSCRATCH, S),
    (SEPC, S),
    (SCAUSE, S),
    (STVAL, S),
    (SIP, S),
    (SATP, S),
    (MVENDORID, M),
    (MARCHID, M),
    (MIMPID, M),
    (MHARTID, M),
    (MCONFIGPTR, M),
    (MSTATUS, M),
    (MISA, M),
    (MEDELEG, M),
    (MIDELEG, M),
    (MIE, M),
    (MTVEC, M),
    (MCOUNTEREN, M),
    (MSTATUSH, M),
    (MSCRATCH, M),
    (MEPC, M),
    (MCAUSE, M),
    (MTVAL, M),
    (MIP, M),
    (MTINST, M),
    (MTVAL2, M),
    (PMPCFG0, U),
    (PMPADDR0, U),
    (PMPADDR1, U),
    (PMPADDR2, U),
    (PMPADDR3, U),
];

/// Returns `true` for `pmpcfg0` and `pmpaddr0..=3`.
pub const fn is_pmp(code: u16) -> bool {
    matches!(code, PMPCFG0 | PMPADDR0 | PMPADDR1 | PMPADDR2 | PMPADDR3)
}

/// One emulated CSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualRegister {
    pub code: u16,
    pub min_mode: PrivilegeMode,
    pub value: u64,
}

impl VirtualRegister {
    /// Whether a guest in `mode` may access this register.
    pub fn accessible_from(&self, mode: PrivilegeMode) -> bool {
        self.min_mode <= mode
    }
}

/// The virtual CSR file, keyed by CSR number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    registers: BTreeMap<u16, VirtualRegister>,
}

impl RegisterFile {
    /// Builds the file with reset values: zero everywhere except `mvendorid`.
    pub fn new(config: &VmmConfig) -> Self {
        let registers = REGISTERS
            .iter()
            .map(|&(code, min_mode)| {
                let value = if code == MVENDORID { config.vendor_id } else { 0 };
                (code, VirtualRegister { code, min_mode, value })
            })
            .collect();
        Self { registers }
    }

    pub fn get(&self, code: u16) -> Option<&VirtualRegister> {
        self.registers.get(&code)
    }

    pub fn lookup(&mut self, code: u16) -> Option<&mut VirtualRegister> {
        self.registers.get_mut(&code)
    }

    /// Current value of `code`, `None` if the register is not emulated.
    pub fn value(&self, code: u16) -> Option<u64> {
        self.get(code).map(|reg| reg.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegister> {
        self.registers.values()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}
