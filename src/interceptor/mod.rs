// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide fault and exception interception.
//!
//! The interceptor has exactly two states. [`enable`] moves it from Disabled
//! to Enabled, installing signal handlers and the panic hook; [`disable`]
//! moves it back, restoring the exact dispositions observed at enable time.
//! Enabling is idempotent. A reported fault disables interception as its
//! very first action, so no two faults are ever processed concurrently.

#[cfg(windows)]
mod exception_filter;
mod panic_hook;
#[cfg(unix)]
mod signal_handlers;

pub use panic_hook::{catch_escaped, ThrownPayload};

use crate::report::{self, ThreadRole};
use crate::shared::configuration::DiagnosticsConfiguration;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Mutex;
use std::thread::ThreadId;

// Mutexes are off-limits inside a signal handler, so the configuration lives
// behind an `AtomicPtr`: always either null_mut or `Box::into_raw()`, which
// means cleanup is always `Box::from_raw` then drop.
static CONFIG: AtomicPtr<DiagnosticsConfiguration> = AtomicPtr::new(ptr::null_mut());
static ENABLED: AtomicBool = AtomicBool::new(false);
// The panic path runs on a normal stack and may lock; the signal path keeps
// its own pthread-based record in signal_handlers.
static PRIMARY_THREAD: Mutex<Option<ThreadId>> = Mutex::new(None);

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("interception is disabled")]
    Disabled,
    #[error("a fault is already being handled")]
    AlreadyHandling,
    #[error("no diagnostics configuration available")]
    NoConfig,
}

/// Enable fault and exception interception, process-wide.
///
/// Expected to be called once at process start, from the primary thread; the
/// calling thread is recorded as primary for the recovery policy. Calling it
/// again while enabled is a no-op.
///
/// PRECONDITIONS:
///     None.
/// SAFETY:
///     Interception functions are not guaranteed to be reentrant. No other
///     interception function should be called concurrently.
/// ATOMICITY:
///     Handler installation is not atomic; a fault racing this function may
///     see handlers registered before the old dispositions are saved.
pub fn enable(mut config: DiagnosticsConfiguration) -> anyhow::Result<()> {
    if ENABLED.swap(true, SeqCst) {
        return Ok(());
    }

    if config.program_path().is_none() {
        if let Ok(exe) = std::env::current_exe() {
            config.set_program_path(exe.to_string_lossy());
        }
    }
    // Computed now so the fault path finds it cached.
    report::os_description();

    if let Ok(mut primary) = PRIMARY_THREAD.lock() {
        *primary = Some(std::thread::current().id());
    }

    let box_ptr = Box::into_raw(Box::new(config));
    let old = CONFIG.swap(box_ptr, SeqCst);
    if !old.is_null() {
        // SAFETY: non-null values can only come from Box::into_raw above.
        unsafe { drop(Box::from_raw(old)) };
    }

    #[cfg(unix)]
    {
        // SAFETY: box_ptr was just stored and nothing frees it before
        // disable; the reference does not outlive this call.
        let config = unsafe { &*box_ptr };
        if let Err(e) = signal_handlers::install(config) {
            ENABLED.store(false, SeqCst);
            return Err(e);
        }
    }
    #[cfg(windows)]
    if let Err(e) = exception_filter::install() {
        ENABLED.store(false, SeqCst);
        return Err(e);
    }

    panic_hook::register();
    log::debug!("fault interception enabled");
    Ok(())
}

/// Disable interception and restore the signal dispositions and panic hook
/// observed at the most recent enable. Idempotent.
///
/// The fault path stands interception down on its own before reporting, so
/// `ENABLED` being false does not mean there is nothing to clean up: the
/// handlers and the hook are still installed at that point. Cleanup runs
/// unconditionally, leaving the state machine ready for a later [`enable`].
pub fn disable() -> anyhow::Result<()> {
    let was_enabled = ENABLED.swap(false, SeqCst);
    #[cfg(unix)]
    signal_handlers::restore()?;
    #[cfg(windows)]
    exception_filter::restore()?;
    panic_hook::unregister();
    let old = CONFIG.swap(ptr::null_mut(), SeqCst);
    if !old.is_null() {
        // SAFETY: non-null values can only come from Box::into_raw in enable.
        unsafe { drop(Box::from_raw(old)) };
    }
    if was_enabled {
        log::debug!("fault interception disabled");
    }
    Ok(())
}

pub fn is_enabled() -> bool {
    ENABLED.load(SeqCst)
}

pub(crate) fn mark_disabled() {
    ENABLED.store(false, SeqCst);
}

/// Snapshot of the active configuration; defaults when not enabled.
pub(crate) fn current_config() -> DiagnosticsConfiguration {
    let config_ptr = CONFIG.load(SeqCst);
    if config_ptr.is_null() {
        DiagnosticsConfiguration::default()
    } else {
        // SAFETY: non-null means Box::into_raw from enable; disable is not
        // called concurrently with readers.
        unsafe { (*config_ptr).clone() }
    }
}

/// Leak the configuration for the fault path. `drop` must not run during
/// a crash; once taken, the global slot stays empty.
pub(crate) fn take_config_for_fault() -> *const DiagnosticsConfiguration {
    CONFIG.swap(ptr::null_mut(), SeqCst)
}

/// Which role the calling thread has, for the panic path.
pub(crate) fn thread_role() -> ThreadRole {
    let current = std::thread::current().id();
    match PRIMARY_THREAD.lock() {
        Ok(primary) => match *primary {
            Some(id) if id == current => ThreadRole::Primary,
            Some(_) => ThreadRole::Worker,
            // Never enabled from a recorded thread; assume the worst.
            None => ThreadRole::Primary,
        },
        Err(_) => ThreadRole::Primary,
    }
}

/// Converts a signum into a Signal. Can't use the From trait because we own
/// neither type.
#[cfg(unix)]
pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(value)
        .map_err(|_| anyhow::anyhow!("unsupported signal number {value}"))
}
