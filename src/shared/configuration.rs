// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stack capture and symbol resolution happen in the context of a crashing
/// process. If the stack is sufficiently corrupted it is possible (but
/// unlikely) for collection itself to crash, so every level can be
/// downgraded independently.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameResolution {
    /// Capture raw addresses only; frames carry no names or line info.
    Disabled,
    /// Resolve names from loaded debug symbol tables, in-process.
    InProcess,
    /// Resolve by invoking the external resolver tool in batch.
    ExternalTool,
    /// Both paths; per address the better result wins.
    Full,
}

/// Validated, process-wide configuration for the diagnostics subsystem.
///
/// Constructed once and handed to [`crate::enable`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfiguration {
    // Path to the program binary handed to the external resolver tool.
    // `None` means "resolve via current_exe at enable time".
    program_path: Option<String>,
    signals: Vec<i32>,
    // SIGABRT is intercepted in normal builds but deliberately left alone
    // when an external test harness raises it internally.
    intercept_abort: bool,
    create_alt_stack: bool,
    use_alt_stack: bool,
    max_frames: usize,
    filter_frames: bool,
    resolve_frames: FrameResolution,
    resolver_timeout: Duration,
}

impl DiagnosticsConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program_path: Option<String>,
        mut signals: Vec<i32>,
        intercept_abort: bool,
        create_alt_stack: bool,
        use_alt_stack: bool,
        max_frames: usize,
        filter_frames: bool,
        resolve_frames: FrameResolution,
        resolver_timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered
        // paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(
            max_frames > 0 && max_frames <= constants::MAX_FRAMES_LIMIT,
            "max_frames must be in 1..={}",
            constants::MAX_FRAMES_LIMIT
        );
        let resolver_timeout = resolver_timeout.unwrap_or(constants::DEFAULT_RESOLVER_TIMEOUT);
        if signals.is_empty() {
            signals = default_signals(intercept_abort);
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            #[cfg(unix)]
            signals
                .iter()
                .try_for_each(|x| crate::signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            program_path,
            signals,
            intercept_abort,
            create_alt_stack,
            use_alt_stack,
            max_frames,
            filter_frames,
            resolve_frames,
            resolver_timeout,
        })
    }

    pub fn program_path(&self) -> Option<&str> {
        self.program_path.as_deref()
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn intercept_abort(&self) -> bool {
        self.intercept_abort
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn filter_frames(&self) -> bool {
        self.filter_frames
    }

    pub fn resolve_frames(&self) -> FrameResolution {
        self.resolve_frames
    }

    pub fn resolver_timeout(&self) -> Duration {
        self.resolver_timeout
    }

    pub fn set_program_path(&mut self, path: impl Into<String>) {
        self.program_path = Some(path.into());
    }
}

impl Default for DiagnosticsConfiguration {
    fn default() -> Self {
        Self {
            program_path: None,
            signals: default_signals(true),
            intercept_abort: true,
            create_alt_stack: true,
            use_alt_stack: true,
            max_frames: constants::DEFAULT_MAX_FRAMES,
            filter_frames: true,
            resolve_frames: FrameResolution::Full,
            resolver_timeout: constants::DEFAULT_RESOLVER_TIMEOUT,
        }
    }
}

/// The catalog of fatal fault codes we intercept by default.
#[cfg(unix)]
pub fn default_signals(intercept_abort: bool) -> Vec<i32> {
    let mut signals = vec![libc::SIGSEGV, libc::SIGILL, libc::SIGFPE, libc::SIGBUS];
    if intercept_abort {
        signals.push(libc::SIGABRT);
    }
    signals
}

#[cfg(windows)]
pub fn default_signals(_intercept_abort: bool) -> Vec<i32> {
    // On Windows faults arrive as structured exception records, not signals.
    Vec::new()
}
