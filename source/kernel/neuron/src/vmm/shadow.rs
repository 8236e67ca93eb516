// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shadow and PMP-restricted copies of a guest page table
//! OWNERS: @kernel-vmm-team
//! PUBLIC API: duplicate_region, restrict_region, build_shadow, build_restricted
//! DEPENDS_ON: mm::PageTable, vmm::pmp
//! INVARIANTS: Copies share backing pages with the source; restriction never frees memory;
//!             a source page missing inside a copied range is an internal fault

use crate::{
    config::VmmConfig,
    log_info,
    mm::{page_round_up, PageTable, PAGE_SIZE},
};

use super::{error::VmmFault, pmp::PmpRegion};

const fn page_round_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Copies every leaf entry in `[start, end)` from `source` into `dest` unchanged.
pub fn duplicate_region(
    source: &PageTable,
    dest: &mut PageTable,
    start: usize,
    end: usize,
) -> Result<(), VmmFault> {
    let mut va = page_round_down(start);
    while va < end {
        let pte = source.walk(va).ok_or(VmmFault::InconsistentMapping { va })?;
        dest.install(va, pte)?;
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Unmaps every page touching `[start, end)`. Returns the number of pages removed.
///
/// Unlike [`duplicate_region`], a page missing from `table` is skipped rather
/// than reported as [`VmmFault::InconsistentMapping`]: PMP regions are sized
/// in physical memory and routinely cover addresses the guest never mapped.
pub fn restrict_region(table: &mut PageTable, start: usize, end: usize) -> Result<usize, VmmFault> {
    if end <= start {
        return Ok(0);
    }
    let end = end.checked_add(PAGE_SIZE - 1).map_or(page_round_down(usize::MAX), page_round_down);
    Ok(table.unmap_range(page_round_down(start), end)?)
}

fn copy_guest_view(
    source: &PageTable,
    size: usize,
    config: &VmmConfig,
) -> Result<PageTable, VmmFault> {
    let mut table = PageTable::new();
    duplicate_region(source, &mut table, 0, page_round_up(size))?;
    duplicate_region(source, &mut table, config.kernel_window_start, config.kernel_window_end)?;
    Ok(table)
}

/// Duplicates user memory `[0, size)` and the kernel window of `source`.
pub fn build_shadow(source: &PageTable, size: usize, config: &VmmConfig) -> Result<PageTable, VmmFault> {
    let table = copy_guest_view(source, size, config)?;
    log_info!(
        target: "vmm-pt",
        "shadow table root ppn {:#x}: {} pages",
        table.root_ppn(),
        table.mapped_pages().len()
    );
    Ok(table)
}

/// Fresh copy of `shadow` with every region lacking full RWX access removed.
pub fn build_restricted(
    shadow: &PageTable,
    size: usize,
    config: &VmmConfig,
    regions: &[PmpRegion],
) -> Result<PageTable, VmmFault> {
    let mut table = copy_guest_view(shadow, size, config)?;
    for region in regions.iter().filter(|region| !region.grants_full_access()) {
        let removed = restrict_region(&mut table, region.start, region.end)?;
        log_info!(target: "vmm-pt", "{}: unmapped {} pages", region, removed);
    }
    Ok(table)
}
