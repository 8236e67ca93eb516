// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39.

pub mod frame;
pub mod page_table;

pub use frame::{Frame, FrameAllocator};
pub use page_table::{MapError, PageFlags, PageTable, Pte, PAGE_SIZE};

/// Rounds `value` up to the next page boundary.
#[inline]
pub const fn page_round_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    #[cfg(not(test))]
    use core::sync::atomic::{AtomicBool, Ordering};

    #[cfg(not(test))]
    static DENY_NEXT_MAP: AtomicBool = AtomicBool::new(false);

    // Armed per thread under the test harness so parallel tests stay isolated.
    #[cfg(test)]
    std::thread_local! {
        static DENY_NEXT_MAP: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
    }

    /// Forces the next leaf insertion to return [`super::MapError::PermissionDenied`].
    pub fn deny_next_map() {
        #[cfg(not(test))]
        DENY_NEXT_MAP.store(true, Ordering::SeqCst);
        #[cfg(test)]
        DENY_NEXT_MAP.with(|flag| flag.set(true));
    }

    pub(crate) fn take_denial() -> bool {
        #[cfg(not(test))]
        {
            DENY_NEXT_MAP.swap(false, Ordering::SeqCst)
        }
        #[cfg(test)]
        {
            DENY_NEXT_MAP.with(|flag| flag.replace(false))
        }
    }
}

#[cfg(not(feature = "failpoints"))]
pub(crate) mod failpoints {
    #[inline(always)]
    pub(crate) fn take_denial() -> bool {
        false
    }
}
