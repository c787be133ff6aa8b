// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Crash diagnostics for long-running, multi-threaded programs.
//!
//! `faultline` intercepts fatal signals and uncaught panics, captures and
//! symbolizes the faulting call stack, and prints a readable failure report
//! before the process (or just the faulting thread) goes down. A fault on
//! the primary thread re-raises under the original disposition once the
//! report is out; a fault on a worker thread ends only that thread.
//!
//! ```no_run
//! faultline::enable(faultline::DiagnosticsConfiguration::default())?;
//! // ... run the program ...
//! faultline::disable()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod callstack;
pub mod capture;
pub mod interceptor;
pub mod normalize;
pub mod report;
pub mod resolver;
pub mod shared;

pub use callstack::{CallStack, Frame};
#[cfg(unix)]
pub use interceptor::signal_from_signum;
pub use interceptor::{
    catch_escaped, disable, enable, is_enabled, InterceptError, ThrownPayload,
};
pub use normalize::{cleanup_function_name, ExclusionRules};
pub use report::{print_report, FailureReport, FaultKind, ThreadRole};
pub use shared::configuration::{default_signals, DiagnosticsConfiguration, FrameResolution};
pub use shared::error::FaultError;

/// Capture and print the current thread's stack trace to the diagnostic
/// stream, using the active configuration when interception is enabled.
pub fn print_stack_trace() {
    let config = interceptor::current_config();
    let stack = CallStack::capture(&config);
    report::print_stack(&stack);
}
