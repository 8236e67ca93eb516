// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the emulator
//! OWNERS: @kernel-vmm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - CSR mediation honors each register's minimum mode
//!   - Privilege transitions are reversible through the return instructions
//!   - PMP restriction removes exactly the denied pages
//!
//! TEST_SCENARIOS:
//!   - write_then_read_roundtrip(): allowed accesses store, denied ones change nothing
//!   - ecall_from_user_enters_supervisor(): sepc records the trapping pc
//!   - escalate_and_return(): U -> S -> M -> S -> U with the saved pcs
//!   - ecall_in_machine_resets_context(): termination restores power-on state
//!   - regions_chain_contiguously(): derivation stops at the first zero address
//!   - restriction_follows_permissions(): RWX keeps pages, anything else unmaps

use proptest::prelude::*;

use super::{
    context::VmContext,
    csr::{self, PrivilegeMode, RegisterFile, REGISTERS},
    mediator, mode, pmp, shadow, Outcome, Violation, VmManager,
};
use crate::{
    config::VmmConfig,
    mm::{FrameAllocator, PageFlags, PageTable, PAGE_SIZE},
    task::ProcessTable,
};

const SMALL: VmmConfig = VmmConfig {
    kernel_window_start: 0x8000_0000,
    kernel_window_end: 0x8000_8000,
    ..VmmConfig::DEFAULT
};

fn arb_mode() -> impl Strategy<Value = PrivilegeMode> {
    prop_oneof![
        Just(PrivilegeMode::User),
        Just(PrivilegeMode::Supervisor),
        Just(PrivilegeMode::Machine),
    ]
}

fn arb_register() -> impl Strategy<Value = (u16, PrivilegeMode)> {
    (0..REGISTERS.len()).prop_map(|index| REGISTERS[index])
}

fn context(mode: PrivilegeMode) -> VmContext {
    let mut ctx = VmContext::new(&SMALL);
    ctx.mode = mode;
    ctx
}

fn window_table() -> PageTable {
    let mut table = PageTable::new();
    let flags = PageFlags::VALID | PageFlags::READ | PageFlags::WRITE;
    for va in (SMALL.kernel_window_start..SMALL.kernel_window_end).step_by(PAGE_SIZE) {
        table.map(va, va, flags).unwrap();
    }
    table
}

proptest! {
    #[test]
    fn write_then_read_roundtrip(
        (code, min_mode) in arb_register(),
        mode in arb_mode(),
        value in any::<u64>(),
    ) {
        let mut ctx = context(mode);
        let before = ctx.registers.value(code);
        let written = mediator::write(&mut ctx, code, value);
        if mode >= min_mode {
            prop_assert_eq!(written, Ok(()));
            prop_assert_eq!(mediator::read(&ctx, code), Ok(value));
        } else {
            let denied = Err(Violation::InsufficientPrivilege {
                csr: code,
                required: min_mode,
                current: mode,
            });
            prop_assert_eq!(written, denied);
            prop_assert_eq!(mediator::read(&ctx, code).map(|_| ()), denied);
            prop_assert_eq!(ctx.registers.value(code), before);
        }
        prop_assert_eq!(ctx.mode, mode);
        prop_assert_eq!(ctx.pmp_configured, csr::is_pmp(code));
    }

    #[test]
    fn ecall_from_user_enters_supervisor(pc in any::<u64>(), handler in any::<u64>()) {
        let mut ctx = context(PrivilegeMode::Machine);
        mediator::write(&mut ctx, csr::STVEC, handler).unwrap();
        ctx.mode = PrivilegeMode::User;
        prop_assert_eq!(mode::ecall(&mut ctx, pc), Ok(handler));
        prop_assert_eq!(ctx.mode, PrivilegeMode::Supervisor);
        prop_assert_eq!(ctx.registers.value(csr::SEPC), Some(pc));
    }

    #[test]
    fn escalate_and_return(user_pc in any::<u64>(), kernel_pc in any::<u64>()) {
        let mut ctx = context(PrivilegeMode::User);
        mode::ecall(&mut ctx, user_pc).unwrap();
        mode::ecall(&mut ctx, kernel_pc).unwrap();
        prop_assert_eq!(ctx.mode, PrivilegeMode::Machine);
        prop_assert_eq!(mode::mret(&mut ctx), Ok(kernel_pc));
        prop_assert_eq!(ctx.mode, PrivilegeMode::Supervisor);
        prop_assert_eq!(mode::sret(&mut ctx), Ok(user_pc));
        prop_assert_eq!(ctx.mode, PrivilegeMode::User);
    }

    #[test]
    fn ecall_in_machine_resets_context(
        writes in proptest::collection::vec((arb_register(), any::<u64>()), 0..8),
    ) {
        let mut manager = VmManager::new(SMALL);
        let mut processes = ProcessTable::new();
        let mut frames = FrameAllocator::new(1);
        let pid = processes.spawn_guest(&[0x0000_0073], PAGE_SIZE, &SMALL, &mut frames).unwrap();
        manager.init(pid);
        if let Some(ctx) = manager.contexts.get_mut(&pid) {
            for ((code, _), value) in writes {
                mediator::write(ctx, code, value).unwrap();
            }
        }

        let process = processes.get_mut(pid).unwrap();
        let outcome = manager.trap_and_emulate(process).unwrap();
        let rejected = matches!(outcome, Outcome::Terminated(Violation::InvalidTransition { .. }));
        prop_assert!(rejected, "unexpected outcome {:?}", outcome);
        prop_assert!(process.is_killed());
        let ctx = manager.context(pid).unwrap();
        prop_assert_eq!(ctx.mode(), PrivilegeMode::Machine);
        prop_assert_eq!(ctx.registers(), &RegisterFile::new(&SMALL));
        prop_assert!(!ctx.pmp_configured());
        prop_assert!(ctx.shadow_table().is_none());
    }

    #[test]
    fn regions_chain_contiguously(
        addrs in proptest::collection::vec(0u64..0x4000_0000, 0..8),
        cfg in any::<u64>(),
    ) {
        let regions = pmp::pmp_regions(&addrs, cfg, SMALL.memory_base);
        let populated = addrs.iter().take_while(|&&addr| addr != 0).count();
        prop_assert_eq!(regions.len(), populated);
        let mut start = SMALL.memory_base;
        for (index, region) in regions.iter().enumerate() {
            prop_assert_eq!(region.index, index);
            prop_assert_eq!(region.start, start);
            prop_assert_eq!(region.end, (addrs[index] << 2) as usize);
            prop_assert_eq!(region.grants_full_access(), (cfg >> (index * 8)) & 7 == 7);
            start = region.end;
        }
    }

    #[test]
    fn restriction_follows_permissions(
        first in 0usize..8,
        pages in 1usize..8,
        perms in any::<u8>(),
    ) {
        let source = window_table();
        let shadow = shadow::build_shadow(&source, 0, &SMALL).unwrap();
        let start = SMALL.kernel_window_start + first * PAGE_SIZE;
        let end = (start + pages * PAGE_SIZE).min(SMALL.kernel_window_end);
        let addrs = [(start >> 2) as u64, (end >> 2) as u64];
        let cfg = (u64::from(perms) << 8) | 0x0f;
        let regions = pmp::pmp_regions(&addrs, cfg, SMALL.memory_base);
        let restricted = shadow::build_restricted(&shadow, 0, &SMALL, &regions[1..]).unwrap();

        for va in (SMALL.kernel_window_start..SMALL.kernel_window_end).step_by(PAGE_SIZE) {
            let inside = va >= start && va < end;
            if inside && perms & 7 != 7 {
                prop_assert!(restricted.walk(va).is_none());
            } else {
                prop_assert_eq!(restricted.walk(va), shadow.walk(va));
            }
            prop_assert!(shadow.walk(va).is_some());
        }
        prop_assert!(restricted.mapped_pages().len() <= shadow.mapped_pages().len());
    }
}
