// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-guest emulation state.

use alloc::sync::Arc;

use crate::{config::VmmConfig, mm::PageTable};

use super::csr::{PrivilegeMode, RegisterFile};

/// Virtual privileged state of one guest process.
#[derive(Clone, Debug)]
pub struct VmContext {
    pub(super) registers: RegisterFile,
    pub(super) mode: PrivilegeMode,
    pub(super) pmp_configured: bool,
    /// Copy of the guest's own table, built on its first privileged trap.
    pub(super) shadow: Option<Arc<PageTable>>,
    /// Shadow minus the PMP-denied regions, rebuilt by every MRET once PMP is programmed.
    pub(super) restricted: Option<Arc<PageTable>>,
}

impl VmContext {
    /// Initial state: reset register values, M-mode, no PMP, no tables.
    pub fn new(config: &VmmConfig) -> Self {
        Self {
            registers: RegisterFile::new(config),
            mode: PrivilegeMode::Machine,
            pmp_configured: false,
            shadow: None,
            restricted: None,
        }
    }

    /// Returns the context to its initial state in place.
    pub fn reset(&mut self, config: &VmmConfig) {
        *self = Self::new(config);
    }

    pub fn mode(&self) -> PrivilegeMode {
        self.mode
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn pmp_configured(&self) -> bool {
        self.pmp_configured
    }

    pub fn shadow_table(&self) -> Option<&Arc<PageTable>> {
        self.shadow.as_ref()
    }

    pub fn restricted_table(&self) -> Option<&Arc<PageTable>> {
        self.restricted.as_ref()
    }
}
