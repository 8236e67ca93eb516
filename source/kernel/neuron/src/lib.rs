// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON trap-and-emulate virtualization layer
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit, property and scenario tests (`cargo test -p neuron-vmm`)
//! PUBLIC API: vmm (VmManager, trap_and_emulate, trap_and_emulate_init), trap, task, mm
//! DEPENDS_ON: bitflags, spin, riscv, static_assertions, thiserror
//! INVARIANTS: Guest privileged state lives only in per-process virtual register files;
//!             page tables are fully built before they are published to a process
//!
//! Guests run in real U-mode. Every privileged instruction they issue traps into
//! the kernel, is decoded against the guest's live page table and emulated on a
//! private copy of the S/M-mode CSR file. Writes to the PMP registers are honored
//! by swapping the guest onto a restricted copy of its own page table.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod diag;
pub mod mm;
pub mod task;
pub mod trap;
pub mod types;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart;
pub mod vmm;

pub use diag::log;
