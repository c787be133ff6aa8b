// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// The closed catalog of failure kinds a report can carry. Each maps to a
/// short label and an explanation sentence; the mapping is static and
/// read-only for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// SIGSEGV or SIGBUS.
    IllegalAccess,
    /// SIGILL.
    IllegalInstruction,
    /// SIGFPE.
    Arithmetic,
    /// SIGABRT.
    Abort,
    /// SIGINT, usually a program stuck in an infinite loop.
    Interrupt,
    /// The custom signal a supervisor raises when console output exceeds
    /// its limit.
    OutputLimit,
    /// Stack exhaustion, synthesized from an illegal access whose fault
    /// address sits near the faulting thread's stack pointer.
    StackOverflow,
    /// A panic or exception nothing caught.
    UncaughtException,
    Unknown,
}

impl FaultKind {
    /// Classify an OS fault code. Stack exhaustion cannot be told apart
    /// here; the interceptor upgrades [`FaultKind::IllegalAccess`] to
    /// [`FaultKind::StackOverflow`] when the fault context says so.
    pub fn from_signum(signum: i32) -> Self {
        #[cfg(unix)]
        {
            match signum {
                libc::SIGSEGV | libc::SIGBUS => Self::IllegalAccess,
                libc::SIGILL => Self::IllegalInstruction,
                libc::SIGFPE => Self::Arithmetic,
                libc::SIGABRT => Self::Abort,
                libc::SIGINT => Self::Interrupt,
                libc::SIGUSR1 => Self::OutputLimit,
                _ => Self::Unknown,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signum;
            Self::Unknown
        }
    }

    /// Short kind label for the report header.
    pub fn label(&self) -> &'static str {
        match self {
            Self::IllegalAccess => "A segmentation fault (SIGSEGV)",
            Self::IllegalInstruction => "An illegal instruction (SIGILL)",
            Self::Arithmetic => "An arithmetic error (SIGFPE)",
            Self::Abort => "An abort error (SIGABRT)",
            Self::Interrupt => "An interrupt error (SIGINT)",
            Self::OutputLimit => "An output limit error",
            Self::StackOverflow => "A stack overflow",
            Self::UncaughtException => "An exception",
            Self::Unknown => "A fatal error",
        }
    }

    /// The longer guidance sentence shown under the label.
    pub fn explanation(&self) -> &'static str {
        match self {
            Self::IllegalAccess => {
                "This typically happens when you try to dereference a pointer\n\
                 that is null or uninitialized or points to invalid memory."
            }
            Self::IllegalInstruction => {
                "This typically happens when your program has corrupted its own memory."
            }
            Self::Arithmetic => {
                "This typically happens when you divide by 0 or produce an overflow."
            }
            Self::Abort => {
                "This error is raised by runtime functions that detect corrupted state."
            }
            Self::Interrupt => {
                "This typically happens when your code gets stuck in an infinite loop."
            }
            Self::OutputLimit => {
                "This happens when your program prints a huge amount of output,\n\
                 usually because of an infinite loop that never stops printing."
            }
            Self::StackOverflow => {
                "This can happen when a function calls itself infinitely."
            }
            Self::UncaughtException => "An exception was thrown and never caught.",
            Self::Unknown => "An unrecognized fatal condition terminated the program.",
        }
    }
}
