// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frames backing guest memory.
//!
//! Kernel memory is identity mapped, so the address of a frame doubles as
//! its physical address when it is entered into a page table.

use alloc::boxed::Box;

use super::PAGE_SIZE;

#[repr(C, align(4096))]
struct FramePage([u8; PAGE_SIZE]);

/// One zeroed, page-aligned physical frame.
pub struct Frame {
    page: Box<FramePage>,
}

impl Frame {
    /// Physical address of the frame.
    pub fn pa(&self) -> usize {
        &*self.page as *const FramePage as usize
    }

    /// Stores a little-endian word at `offset`. Out-of-range offsets are ignored.
    pub fn write_u32(&mut self, offset: usize, word: u32) {
        if let Some(bytes) = self.page.0.get_mut(offset..offset + 4) {
            bytes.copy_from_slice(&word.to_le_bytes());
        }
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.page.0.get(offset..offset + 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(bytes);
        Some(u32::from_le_bytes(word))
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame({:#x})", self.pa())
    }
}

/// Hands out frames up to a fixed budget.
#[derive(Debug)]
pub struct FrameAllocator {
    limit: usize,
    allocated: usize,
}

impl FrameAllocator {
    pub const fn new(limit: usize) -> Self {
        Self { limit, allocated: 0 }
    }

    /// Allocates a zeroed frame, or `None` once the budget is spent.
    pub fn alloc(&mut self) -> Option<Frame> {
        if self.allocated >= self.limit {
            return None;
        }
        self.allocated += 1;
        Some(Frame { page: Box::new(FramePage([0; PAGE_SIZE])) })
    }
}
