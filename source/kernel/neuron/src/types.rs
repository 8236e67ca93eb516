// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the trap path and the process table
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, Pid
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, PAGE_SIZE
//! INVARIANTS: Canonical Sv39 addresses only; PIDs start at 1

use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};
use core::fmt;

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Accepts only addresses of full-width (32-bit) instructions.
    #[inline]
    pub fn instr_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % core::mem::size_of::<u32>() == 0)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Start of the page holding this address.
    #[inline]
    pub fn page_base(self) -> usize {
        self.0 & !(PAGE_SIZE - 1)
    }

    /// Byte offset inside the page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

/// Process identifier (PID).
///
/// **Ownership**: Only `ProcessTable` hands out PIDs.
/// **Invariant**: PID 0 is never handed to a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a PID from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_alignment_is_four_bytes() {
        assert!(VirtAddr::instr_aligned(0x1000).is_some());
        assert!(VirtAddr::instr_aligned(0x1002).is_none());
        assert!(VirtAddr::instr_aligned(1usize << 45).is_none());
    }

    #[test]
    fn page_split() {
        let va = VirtAddr::new(0x8000_1234).unwrap();
        assert_eq!(va.page_base(), 0x8000_1000);
        assert_eq!(va.page_offset(), 0x234);
    }
}
