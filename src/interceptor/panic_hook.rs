// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! The uncaught-panic hook and payload classification.

use crate::callstack::CallStack;
use crate::report::{self, FailureReport, FaultKind, ThreadRole};
use crate::shared::constants::WORKER_FLUSH_WAIT;
use crate::shared::error::FaultError;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, PanicHookInfo, UnwindSafe};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
// Always null_mut or `Box::into_raw()`, like the configuration pointer.
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    // Set while user code runs inside a declared no-panic boundary; the
    // boundary reports the escape itself and the global hook stays quiet.
    static IN_DECLARED_BOUNDARY: Cell<bool> = const { Cell::new(false) };
}

/// Install the uncaught-panic hook, keeping the previous hook so disable can
/// put it back. Registering twice is a no-op.
pub(super) fn register() {
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(handle_uncaught_panic));
}

/// Put the hook observed at register time back.
pub(super) fn unregister() {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.swap(ptr::null_mut(), SeqCst);
    if !old_hook_ptr.is_null() {
        // SAFETY: non-null values can only come from Box::into_raw in
        // register; no panic is being handled concurrently with disable.
        let old_hook = unsafe { Box::from_raw(old_hook_ptr) };
        panic::set_hook(*old_hook);
    }
}

fn call_previous_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // SAFETY: the pointer came from Box::into_raw in register. Borrowed,
        // not taken, so it remains valid for future calls.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}

/// The hook itself. Reports the panic as an uncaught exception, then lets
/// unwinding proceed: an uncaught primary-thread panic ends the process via
/// the runtime, a worker-thread panic ends only that thread. The worker path
/// waits briefly so concurrently-buffered output can flush first.
fn handle_uncaught_panic(panic_info: &PanicHookInfo<'_>) {
    if !super::is_enabled() || IN_DECLARED_BOUNDARY.with(|flag| flag.get()) {
        call_previous_hook(panic_info);
        return;
    }

    let thrown = ThrownPayload::classify(panic_info.payload());
    let mut message = thrown.message();
    if let Some(location) = panic_info.location() {
        message.push_str(&format!("\nraised at {location}"));
    }

    let config = super::current_config();
    let stack = CallStack::capture(&config);
    let role = super::thread_role();
    let report = FailureReport::new(FaultKind::UncaughtException, message, Some(stack), role);
    report::print_report(&report);

    if role == ThreadRole::Worker {
        std::thread::sleep(WORKER_FLUSH_WAIT);
    }
}

/// Run `f` as a declared no-panic boundary. A panic escaping `f` is reported
/// and handed back as a normalized [`FaultError`] instead of propagating.
pub fn catch_escaped<R>(
    boundary: &str,
    f: impl FnOnce() -> R + UnwindSafe,
) -> Result<R, FaultError> {
    // Boundaries nest; an inner one must hand the flag back as it found it,
    // or a panic between the two would reach the global hook as well.
    let previous = IN_DECLARED_BOUNDARY.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(f);
    IN_DECLARED_BOUNDARY.with(|flag| flag.set(previous));
    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => {
            let thrown = ThrownPayload::classify(payload.as_ref());
            let report = FailureReport::new(
                FaultKind::UncaughtException,
                format!(
                    "{}\nthe exception escaped `{boundary}`, which promises not to throw",
                    thrown.message()
                ),
                None,
                super::thread_role(),
            );
            report::print_report(&report);
            Err(FaultError::with_kind(thrown.kind_label(), thrown.message()))
        }
    }
}

/// What an uncaught panic carried, reduced to the closed set of shapes the
/// reporter knows how to phrase.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrownPayload {
    /// A structured [`FaultError`], the shape cooperating code throws.
    Error(FaultError),
    /// An owned string, the usual formatted-panic payload.
    Message(String),
    /// A borrowed literal.
    Text(String),
    Int(i32),
    Wide(i64),
    Char(char),
    Bool(bool),
    Float(f64),
    Unknown,
}

impl ThrownPayload {
    pub fn classify(payload: &(dyn Any + Send)) -> Self {
        if let Some(error) = payload.downcast_ref::<FaultError>() {
            Self::Error(error.clone())
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::Message(message.clone())
        } else if let Some(text) = payload.downcast_ref::<&str>() {
            Self::Text((*text).to_string())
        } else if let Some(value) = payload.downcast_ref::<i32>() {
            Self::Int(*value)
        } else if let Some(value) = payload.downcast_ref::<i64>() {
            Self::Wide(*value)
        } else if let Some(value) = payload.downcast_ref::<char>() {
            Self::Char(*value)
        } else if let Some(value) = payload.downcast_ref::<bool>() {
            Self::Bool(*value)
        } else if let Some(value) = payload.downcast_ref::<f64>() {
            Self::Float(*value)
        } else {
            Self::Unknown
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Message(_) | Self::Text(_) => "string exception",
            Self::Int(_) => "int exception",
            Self::Wide(_) => "long exception",
            Self::Char(_) => "char exception",
            Self::Bool(_) => "bool exception",
            Self::Float(_) => "double exception",
            Self::Unknown => "unknown exception",
        }
    }

    /// The message line(s) shown in the report body.
    pub fn message(&self) -> String {
        match self {
            Self::Error(error) if error.kind() == "error" => error.message().to_string(),
            Self::Error(error) => format!("{}: {}", error.kind(), error.message()),
            Self::Message(text) | Self::Text(text) => text.clone(),
            Self::Int(value) => format!("an int exception was thrown: {value}"),
            Self::Wide(value) => format!("a long exception was thrown: {value}"),
            Self::Char(value) => format!("a char exception was thrown: '{value}'"),
            Self::Bool(value) => format!("a bool exception was thrown: {value}"),
            Self::Float(value) => format!("a double exception was thrown: {value}"),
            Self::Unknown => "an exception of unknown type was thrown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(payload: impl Any + Send) -> Box<dyn Any + Send> {
        Box::new(payload)
    }

    #[test]
    fn test_classify_structured_error() {
        let payload = boxed(FaultError::new("index out of range"));
        let thrown = ThrownPayload::classify(payload.as_ref());
        assert_eq!(thrown.kind_label(), "error");
        assert_eq!(thrown.message(), "index out of range");
    }

    #[test]
    fn test_classify_strings() {
        let owned = boxed("boom".to_string());
        assert_eq!(
            ThrownPayload::classify(owned.as_ref()),
            ThrownPayload::Message("boom".to_string())
        );
        let literal = boxed("bang");
        assert_eq!(
            ThrownPayload::classify(literal.as_ref()),
            ThrownPayload::Text("bang".to_string())
        );
    }

    #[test]
    fn test_classify_numeric_widths() {
        assert_eq!(
            ThrownPayload::classify(boxed(42i32).as_ref()),
            ThrownPayload::Int(42)
        );
        assert_eq!(
            ThrownPayload::classify(boxed(42i64).as_ref()),
            ThrownPayload::Wide(42)
        );
        assert_eq!(
            ThrownPayload::classify(boxed(2.5f64).as_ref()),
            ThrownPayload::Float(2.5)
        );
    }

    #[test]
    fn test_classify_unknown_shape() {
        struct Opaque;
        let thrown = ThrownPayload::classify(boxed(Opaque).as_ref());
        assert_eq!(thrown, ThrownPayload::Unknown);
        assert!(thrown.message().contains("unknown type"));
    }

    #[test]
    fn test_catch_escaped_passes_values_through() {
        let result = catch_escaped("the comparator", || 7);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_catch_escaped_normalizes_panic() {
        let result: Result<(), FaultError> =
            catch_escaped("the comparator", || panic!("bad compare"));
        let error = result.unwrap_err();
        assert_eq!(error.kind(), "string exception");
        assert_eq!(error.message(), "bad compare");
    }

    #[test]
    fn test_nested_boundaries_keep_outer_flag() {
        let result = catch_escaped("the outer pass", || {
            let inner = catch_escaped("the inner pass", || 1);
            assert_eq!(inner.unwrap(), 1);
            // Still inside the outer boundary after the inner one exits.
            assert!(IN_DECLARED_BOUNDARY.with(|flag| flag.get()));
            2
        });
        assert_eq!(result.unwrap(), 2);
        assert!(!IN_DECLARED_BOUNDARY.with(|flag| flag.get()));
    }

    #[test]
    fn test_panic_between_nested_boundaries_caught_once() {
        let result: Result<(), FaultError> = catch_escaped("the outer pass", || {
            let inner = catch_escaped("the inner pass", || 3);
            assert_eq!(inner.unwrap(), 3);
            panic!("after the inner boundary")
        });
        let error = result.unwrap_err();
        assert_eq!(error.kind(), "string exception");
        assert_eq!(error.message(), "after the inner boundary");
    }

    #[test]
    fn test_catch_escaped_keeps_structured_kind() {
        let result: Result<(), FaultError> = catch_escaped("the validator", || {
            std::panic::panic_any(FaultError::with_kind("precondition", "negative size"))
        });
        let error = result.unwrap_err();
        assert_eq!(error.kind(), "error");
        assert_eq!(error.message(), "precondition: negative size");
    }
}
