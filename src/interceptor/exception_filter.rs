// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Windows unhandled-exception filter installation and the fault path.
//!
//! The filter is the SEH counterpart of the POSIX signal handlers: it runs
//! after every frame has declined the exception, classifies the exception
//! code, walks the context record the dispatcher froze at fault time, and
//! prints the report. It then puts the previous filter back and continues
//! the search, so the OS performs its normal termination.

use super::InterceptError;
use crate::callstack::CallStack;
use crate::capture;
use crate::report::{self, FailureReport, FaultKind, ThreadRole};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use windows::Win32::Foundation::{
    EXCEPTION_ACCESS_VIOLATION, EXCEPTION_FLT_DIVIDE_BY_ZERO, EXCEPTION_FLT_OVERFLOW,
    EXCEPTION_ILLEGAL_INSTRUCTION, EXCEPTION_IN_PAGE_ERROR, EXCEPTION_INT_DIVIDE_BY_ZERO,
    EXCEPTION_INT_OVERFLOW, EXCEPTION_PRIV_INSTRUCTION, EXCEPTION_STACK_OVERFLOW, NTSTATUS,
};
use windows::Win32::System::Diagnostics::Debug::{
    SetUnhandledExceptionFilter, EXCEPTION_POINTERS, LPTOP_LEVEL_EXCEPTION_FILTER,
};
use windows::Win32::System::Threading::{ExitThread, GetCurrentThreadId};

// EXCEPTION_CONTINUE_SEARCH: hand the exception to the next filter.
const CONTINUE_SEARCH: i32 = 0;

static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

// The filter returned by SetUnhandledExceptionFilter at install time. Only
// touched between INIT_STARTED and INIT_FINISHED transitions.
static mut PREVIOUS_FILTER: LPTOP_LEVEL_EXCEPTION_FILTER = None;

// Thread id of the thread that called enable; the recovery policy compares
// the faulting thread against it.
static PRIMARY_THREAD_ID: AtomicU32 = AtomicU32::new(0);

// One crash report per installation. install() zeroes it, so
// disable-then-enable arms the filter again.
static FAULTS_HANDLED: AtomicU64 = AtomicU64::new(0);

/// Registers the process-wide unhandled-exception filter.
///
/// PRECONDITIONS:
///     Called from the enable path only, at most once per enable.
/// SAFETY:
///     Interception functions are not guaranteed to be reentrant. No other
///     interception function should be called concurrently.
pub(super) fn install() -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register the exception filter"
    );

    // SAFETY: GetCurrentThreadId has no preconditions.
    PRIMARY_THREAD_ID.store(unsafe { GetCurrentThreadId() }, SeqCst);
    FAULTS_HANDLED.store(0, SeqCst);

    // SAFETY: `INIT_STARTED` is true and `INIT_FINISHED` false, so this is
    // the only code touching `PREVIOUS_FILTER`.
    unsafe {
        PREVIOUS_FILTER = SetUnhandledExceptionFilter(Some(handle_unhandled_exception));
    }
    INIT_FINISHED.store(true, SeqCst);
    Ok(())
}

/// Put the filter observed at install time back and reset the init state so
/// a later enable can install again.
pub(super) fn restore() -> anyhow::Result<()> {
    if INIT_FINISHED.load(SeqCst) {
        // SAFETY: `INIT_FINISHED` is true, so install is done mutating; this
        // runs only from the disable path, never concurrently.
        unsafe {
            SetUnhandledExceptionFilter(PREVIOUS_FILTER.take());
        }
    }
    INIT_FINISHED.store(false, SeqCst);
    INIT_STARTED.store(false, SeqCst);
    Ok(())
}

unsafe extern "system" fn handle_unhandled_exception(
    exception_info: *mut EXCEPTION_POINTERS,
) -> i32 {
    let role = handle_exception_impl(exception_info).ok();
    // Hand subsequent exceptions to whoever owned them before enable.
    if INIT_FINISHED.load(SeqCst) {
        SetUnhandledExceptionFilter(PREVIOUS_FILTER);
    }
    if role == Some(ThreadRole::Worker) {
        // End only the faulting thread; the process keeps running.
        ExitThread(1);
    }
    CONTINUE_SEARCH
}

fn handle_exception_impl(
    exception_info: *mut EXCEPTION_POINTERS,
) -> Result<ThreadRole, InterceptError> {
    if FAULTS_HANDLED.fetch_add(1, SeqCst) > 0 {
        return Err(InterceptError::AlreadyHandling);
    }
    if !super::is_enabled() {
        return Err(InterceptError::Disabled);
    }
    // First action: stand down, so nothing re-enters interception while the
    // report is being built.
    super::mark_disabled();

    // Leak the configuration; `drop` must not run during a crash.
    let config_ptr = super::take_config_for_fault();
    if config_ptr.is_null() {
        return Err(InterceptError::NoConfig);
    }
    // SAFETY: non-null means Box::into_raw from enable, leaked just above.
    let config = unsafe { &*config_ptr };

    // SAFETY: the dispatcher hands the filter valid pointers or null.
    let (kind, stack) = unsafe { diagnose(exception_info, config) };

    let role = fault_thread_role();
    let report = FailureReport::new(kind, "", Some(stack), role);
    report::print_report(&report);
    Ok(role)
}

/// Classify the exception record and walk the frozen fault-time context.
///
/// SAFETY:
///     `exception_info` and the records it points at must be valid or null,
///     which the exception dispatcher guarantees.
unsafe fn diagnose(
    exception_info: *mut EXCEPTION_POINTERS,
    config: &crate::shared::configuration::DiagnosticsConfiguration,
) -> (FaultKind, CallStack) {
    if exception_info.is_null() {
        return (FaultKind::Unknown, CallStack::capture(config));
    }
    let record_ptr = (*exception_info).ExceptionRecord;
    let kind = if record_ptr.is_null() {
        FaultKind::Unknown
    } else {
        kind_from_exception_code((*record_ptr).ExceptionCode)
    };
    let context_ptr = (*exception_info).ContextRecord;
    let stack = if context_ptr.is_null() {
        CallStack::capture(config)
    } else {
        // Walking mutates the context, so work on a copy and leave the
        // dispatcher's record untouched for the next filter.
        let mut context = *context_ptr;
        let captured = capture::walk_seeded(&mut context, config.max_frames());
        CallStack::assemble(config, captured)
    };
    (kind, stack)
}

fn kind_from_exception_code(code: NTSTATUS) -> FaultKind {
    match code {
        EXCEPTION_ACCESS_VIOLATION | EXCEPTION_IN_PAGE_ERROR => FaultKind::IllegalAccess,
        EXCEPTION_STACK_OVERFLOW => FaultKind::StackOverflow,
        EXCEPTION_INT_DIVIDE_BY_ZERO
        | EXCEPTION_FLT_DIVIDE_BY_ZERO
        | EXCEPTION_INT_OVERFLOW
        | EXCEPTION_FLT_OVERFLOW => FaultKind::Arithmetic,
        EXCEPTION_ILLEGAL_INSTRUCTION | EXCEPTION_PRIV_INSTRUCTION => {
            FaultKind::IllegalInstruction
        }
        _ => FaultKind::Unknown,
    }
}

fn fault_thread_role() -> ThreadRole {
    let primary = PRIMARY_THREAD_ID.load(SeqCst);
    // SAFETY: GetCurrentThreadId has no preconditions.
    let current = unsafe { GetCurrentThreadId() };
    if primary == 0 || primary == current {
        ThreadRole::Primary
    } else {
        ThreadRole::Worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_classification() {
        assert_eq!(
            kind_from_exception_code(EXCEPTION_ACCESS_VIOLATION),
            FaultKind::IllegalAccess
        );
        assert_eq!(
            kind_from_exception_code(EXCEPTION_STACK_OVERFLOW),
            FaultKind::StackOverflow
        );
        assert_eq!(
            kind_from_exception_code(EXCEPTION_INT_DIVIDE_BY_ZERO),
            FaultKind::Arithmetic
        );
        assert_eq!(
            kind_from_exception_code(EXCEPTION_ILLEGAL_INSTRUCTION),
            FaultKind::IllegalInstruction
        );
        assert_eq!(
            kind_from_exception_code(NTSTATUS(0x1234)),
            FaultKind::Unknown
        );
    }
}
