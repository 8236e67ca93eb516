// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! PMP region derivation from the virtual `pmpcfg0`/`pmpaddr` registers.
//!
//! Every entry is treated as top-of-range: entry `i` covers
//! `[pmpaddr[i-1] << 2, pmpaddr[i] << 2)` and entry 0 starts at the base of
//! memory. The address-matching field of the configuration byte is decoded
//! for diagnostics only.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission and lock bits of one `pmpcfg` byte lane.
    pub struct PmpPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const LOCKED = 1 << 7;
    }
}

impl PmpPerms {
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// Address-matching mode, bits 4:3 of a configuration byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMatching {
    Off,
    Tor,
    Na4,
    Napot,
}

impl AddressMatching {
    const fn from_cfg(byte: u8) -> Self {
        match (byte >> 3) & 0b11 {
            0 => Self::Off,
            1 => Self::Tor,
            2 => Self::Na4,
            _ => Self::Napot,
        }
    }
}

/// One derived PMP region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpRegion {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub perms: PmpPerms,
    pub matching: AddressMatching,
}

impl PmpRegion {
    /// Whether the guest keeps read, write and execute access to the region.
    pub fn grants_full_access(&self) -> bool {
        self.perms.contains(PmpPerms::RWX)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for PmpRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pmp{} [{:#x}, {:#x}) {}{}{}",
            self.index,
            self.start,
            self.end,
            if self.perms.contains(PmpPerms::READ) { 'r' } else { '-' },
            if self.perms.contains(PmpPerms::WRITE) { 'w' } else { '-' },
            if self.perms.contains(PmpPerms::EXECUTE) { 'x' } else { '-' },
        )
    }
}

/// Derives the configured regions in entry order, stopping at the first zero `pmpaddr`.
pub fn pmp_regions(addrs: &[u64], cfg: u64, memory_base: usize) -> Vec<PmpRegion> {
    let mut regions = Vec::new();
    let mut start = memory_base;
    for (index, &addr) in addrs.iter().enumerate().take(8) {
        if addr == 0 {
            break;
        }
        let byte = (cfg >> (index * 8)) as u8;
        let end = (addr << 2) as usize;
        regions.push(PmpRegion {
            index,
            start,
            end,
            perms: PmpPerms::from_bits_truncate(byte),
            matching: AddressMatching::from_cfg(byte),
        });
        start = end;
    }
    regions
}
