// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use super::failpoints;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address not page aligned")]
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    #[error("address outside the canonical Sv39 range")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("mapping denied")]
    PermissionDenied,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a valid leaf")]
    InvalidFlags,
    /// No leaf entry exists at the address.
    #[error("no mapping present")]
    NotMapped,
}

/// Raw Sv39 page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    /// Builds a leaf entry pointing at `pa`.
    pub const fn leaf(pa: usize, flags: PageFlags) -> Self {
        Self(((pa / PAGE_SIZE) << 10) | flags.bits())
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    /// Physical address of the referenced page.
    pub const fn pa(self) -> usize {
        (self.0 >> 10) << 12
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0x3ff)
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Valid entries with any of R/W/X set terminate the walk.
    pub const fn is_leaf(self) -> bool {
        self.is_valid() && self.0 & LEAF_PERMS.bits() != 0
    }
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
///
/// Unmapping clears leaf entries only; the backing pages belong to whoever
/// mapped them and intermediate levels live until the table is dropped.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    owned: Vec<NonNull<PageTablePage>>,
}

// SAFETY: the table exclusively owns every page reachable from `root`; shared
// access only reads entries, mutation requires `&mut self`.
unsafe impl Send for PageTable {}
// SAFETY: see `Send`.
unsafe impl Sync for PageTable {}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_page();
        Self { root, owned: vec![root] }
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.as_ptr() as usize / PAGE_SIZE
    }

    /// Looks up the leaf entry mapped at page-aligned `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 {
            return None;
        }
        self.walk(va).map(Pte::bits)
    }

    /// Returns the valid leaf entry covering `va`.
    pub fn walk(&self, va: usize) -> Option<Pte> {
        if !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (0..LEVELS).rev() {
            // SAFETY: `table` is either the root or a page installed by `map`/`install`.
            let entry = Pte(unsafe { (*table.as_ptr()).entries[indices[level]] });
            if !entry.is_valid() {
                return None;
            }
            if level == 0 {
                return if entry.is_leaf() { Some(entry) } else { None };
            }
            if entry.is_leaf() {
                // Superpages are never created by this table.
                return None;
            }
            table = NonNull::new(entry.pa() as *mut PageTablePage)?;
        }
        None
    }

    /// Translates `va` to the physical address it maps to, offset included.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.walk(va).map(|pte| pte.pa() | (va & (PAGE_SIZE - 1)))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }
        let slot = self.leaf_slot(va)?;
        if Pte(*slot).is_valid() {
            return Err(MapError::Overlap);
        }
        *slot = Pte::leaf(pa, flags).bits();
        Ok(())
    }

    /// Copies an existing leaf entry verbatim to `va`.
    ///
    /// An identical entry already present at `va` is accepted, any other valid
    /// entry is reported as [`MapError::Overlap`].
    pub fn install(&mut self, va: usize, pte: Pte) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if !pte.is_leaf() {
            return Err(MapError::InvalidFlags);
        }
        let slot = self.leaf_slot(va)?;
        let current = Pte(*slot);
        if current == pte {
            return Ok(());
        }
        if current.is_valid() {
            return Err(MapError::Overlap);
        }
        *slot = pte.bits();
        Ok(())
    }

    /// Removes the leaf entry at `va`; the referenced page is left alone.
    pub fn unmap(&mut self, va: usize) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let slot = self.existing_leaf_slot(va).ok_or(MapError::NotMapped)?;
        *slot = 0;
        Ok(())
    }

    /// Removes every leaf in `[start, end)`, skipping pages that are not mapped.
    /// Returns the number of entries cleared.
    pub fn unmap_range(&mut self, start: usize, end: usize) -> Result<usize, MapError> {
        if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        // Walk the populated leaves instead of the range: PMP-sized ranges can
        // span most of the address space.
        let mut cleared = 0;
        for (va, _) in self.mapped_pages() {
            if va >= start && va < end {
                self.unmap(va)?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Lists every leaf mapping in ascending virtual-address order.
    pub fn mapped_pages(&self) -> Vec<(usize, Pte)> {
        let mut pages = Vec::new();
        collect_leaves(self.root, LEVELS - 1, 0, &mut pages);
        pages
    }

    /// Walks to the level-0 slot for `va`, allocating intermediate levels.
    fn leaf_slot(&mut self, va: usize) -> Result<&mut usize, MapError> {
        if failpoints::take_denial() {
            return Err(MapError::PermissionDenied);
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            // SAFETY: `table` is owned by `self` and no other reference to it is live.
            let entry = unsafe { &mut (*table.as_ptr()).entries[indices[level]] };
            let pte = Pte(*entry);
            if pte.is_valid() {
                if pte.is_leaf() {
                    return Err(MapError::Overlap);
                }
                table = NonNull::new(pte.pa() as *mut PageTablePage).ok_or(MapError::OutOfRange)?;
                continue;
            }
            let next = Self::alloc_page();
            self.owned.push(next);
            *entry = ((next.as_ptr() as usize / PAGE_SIZE) << 10) | PageFlags::VALID.bits();
            table = next;
        }
        // SAFETY: as above; the returned borrow is tied to `&mut self`.
        Ok(unsafe { &mut (*table.as_ptr()).entries[indices[0]] })
    }

    fn existing_leaf_slot(&mut self, va: usize) -> Option<&mut usize> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            // SAFETY: `table` is owned by `self`.
            let pte = Pte(unsafe { (*table.as_ptr()).entries[indices[level]] });
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            table = NonNull::new(pte.pa() as *mut PageTablePage)?;
        }
        // SAFETY: as above; the returned borrow is tied to `&mut self`.
        let slot = unsafe { &mut (*table.as_ptr()).entries[indices[0]] };
        if Pte(*slot).is_leaf() {
            Some(slot)
        } else {
            None
        }
    }

    fn alloc_page() -> NonNull<PageTablePage> {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

impl core::fmt::Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable")
            .field("root_ppn", &self.root_ppn())
            .field("pages", &self.owned.len())
            .finish()
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

fn collect_leaves(
    table: NonNull<PageTablePage>,
    level: usize,
    prefix: usize,
    out: &mut Vec<(usize, Pte)>,
) {
    for index in 0..PT_ENTRIES {
        // SAFETY: `table` is reachable from a live root.
        let pte = Pte(unsafe { (*table.as_ptr()).entries[index] });
        if !pte.is_valid() {
            continue;
        }
        let va = prefix | (index << (12 + 9 * level));
        if level == 0 {
            if pte.is_leaf() {
                out.push((sign_extend_sv39(va), pte));
            }
        } else if !pte.is_leaf() {
            if let Some(next) = NonNull::new(pte.pa() as *mut PageTablePage) {
                collect_leaves(next, level - 1, va, out);
            }
        }
    }
}

fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn0, vpn1, vpn2]
}

fn sign_extend_sv39(va: usize) -> usize {
    if (va >> 38) & 1 == 1 {
        va | !((1usize << 39) - 1)
    } else {
        va
    }
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
