// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime parameters of the virtualization layer.

/// Layout and identity constants threaded through the emulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmmConfig {
    /// First byte of the kernel window copied into every shadow table.
    pub kernel_window_start: usize,
    /// End (exclusive) of the kernel window.
    pub kernel_window_end: usize,
    /// Lower bound of PMP region 0.
    pub memory_base: usize,
    /// Number of `pmpaddr` registers honored when deriving regions.
    pub pmp_entries: usize,
    /// Reset value of the virtual `mvendorid`.
    pub vendor_id: u64,
}

impl VmmConfig {
    /// QEMU `virt` layout: RAM at 0x8000_0000, 4 MiB kernel image window.
    pub const DEFAULT: Self = Self {
        kernel_window_start: 0x8000_0000,
        kernel_window_end: 0x8040_0000,
        memory_base: 0x8000_0000,
        pmp_entries: 4,
        vendor_id: 0x6373_6535_3336,
    };
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
