// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used by the virtualization layer.
//!
//! Only the raw privileged accessors the trap path needs live here. Host
//! builds get lightweight stubs so the emulation logic can be exercised by
//! `cargo test`; the TLB stub counts flushes so tests can observe page-table
//! switches.

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);

/// Reads the hardware `sepc` latched at trap entry.
#[inline]
#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
pub fn read_sepc() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::sepc::read()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Invalidates every cached translation on the local hart.
#[inline]
pub fn flush_tlb() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        riscv::asm::sfence_vma_all();
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        TLB_FLUSHES.fetch_add(1, Ordering::SeqCst);
    }
}

/// Number of TLB flushes issued on the host since start-up.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn tlb_flush_count() -> usize {
    TLB_FLUSHES.load(Ordering::SeqCst)
}
