// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! POSIX signal handler installation and the fault path itself.
//!
//! Note that the fault path only uses async-signal safe functions
//! (<https://man7.org/linux/man-pages/man7/signal-safety.7.html>): raise,
//! sigaction, write, plus address arithmetic over the already-frozen
//! context. Symbol resolution may allocate; by the time it runs the
//! re-entrancy guard has already made a second fault non-recursive.

use super::InterceptError;
use crate::callstack::CallStack;
use crate::capture::FaultContext;
use crate::report::{self, FailureReport, FaultKind, ThreadRole};
use crate::shared::configuration::DiagnosticsConfiguration;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, ucontext_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

// Linux seems to have the most, supporting up to 64 inclusive.
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut SAVED_ACTIONS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

// pthread id of the thread that called enable; the recovery policy compares
// the faulting thread against it.
static PRIMARY_PTHREAD: AtomicUsize = AtomicUsize::new(0);

// Writable base of the alternate signal stack, 0 when none was created. The
// guard page sits in the page below it.
static ALT_STACK_BASE: AtomicUsize = AtomicUsize::new(0);

// A fault address within this distance of the stack pointer is taken to be
// a stack-guard hit rather than a stray dereference.
const STACK_GUARD_SLACK: usize = 32 * 1024;

// One crash report per installation. A second fault while reporting the
// first (including a fault inside resolution itself) bails out early.
// install() zeroes it, so disable-then-enable arms the handler again.
static FAULTS_HANDLED: AtomicU64 = AtomicU64::new(0);

/// Registers UNIX signal handlers for the configured fault signals.
///
/// PRECONDITIONS:
///     Called from the enable path only, at most once per enable.
/// SAFETY:
///     Interception functions are not guaranteed to be reentrant. No other
///     interception function should be called concurrently.
/// ATOMICITY:
///     Not atomic. A fault during execution may find the handler registered
///     but the old disposition not yet saved.
pub(super) fn install(config: &DiagnosticsConfiguration) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register fault handlers"
    );

    // Validate signal numbers will fit in the array.
    for signum in config.signals() {
        anyhow::ensure!(*signum >= 0 && *signum < MAX_SIGNALS as i32);
    }

    PRIMARY_PTHREAD.store(unsafe { libc::pthread_self() } as usize, SeqCst);
    FAULTS_HANDLED.store(0, SeqCst);

    if config.create_alt_stack() {
        // SAFETY: no documented preconditions.
        unsafe { create_alt_stack()? };
    }

    let mut errors = vec![];
    for signum in config.signals() {
        let index = *signum as usize;
        // SAFETY: `INIT_STARTED` is true and `INIT_FINISHED` false, so this
        // is the only code touching `SAVED_ACTIONS`; the fault path reads it
        // only once `INIT_FINISHED` is true.
        match unsafe { register_signal_handler(*signum, config) } {
            Ok(saved) => unsafe { SAVED_ACTIONS[index] = Some(saved) },
            Err(e) => errors.push(format!("Unable to register signal {signum}: {e:?}")),
        }
    }
    INIT_FINISHED.store(true, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

/// Restore every disposition saved by [`install`] and reset the init state
/// so a later enable can install again.
pub(super) fn restore() -> anyhow::Result<()> {
    let mut errors = vec![];
    if INIT_FINISHED.load(SeqCst) {
        for index in 0..MAX_SIGNALS {
            // SAFETY: `INIT_FINISHED` is true, so install is done mutating;
            // this runs only from the disable path, never concurrently.
            if let Some((sig, action)) = unsafe { SAVED_ACTIONS[index].take() } {
                // SAFETY: restoring a disposition previously returned by
                // sigaction.
                if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
                    errors.push(format!("Unable to restore disposition for {sig}: {e}"));
                }
            }
        }
    }
    INIT_FINISHED.store(false, SeqCst);
    INIT_STARTED.store(false, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors restoring signal dispositions {errors:?}"
    );
    Ok(())
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The default SIGSTKSZ is 8KB, which symbol resolution can exceed; use
    // the greater of 16 pages or SIGSTKSZ.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    ALT_STACK_BASE.store(stackp as usize, SeqCst);
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    config: &DiagnosticsConfiguration,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = super::signal_from_signum(signum)?;
    let extra_saflags = if config.use_alt_stack() {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );
    let old_action = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_action))
}

pub(super) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let role = handle_posix_signal_impl(signum, sig_info, ucontext as *mut ucontext_t).ok();
    // SAFETY: restores dispositions saved by install.
    unsafe { recover(signum, role) };
}

fn handle_posix_signal_impl(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
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

    // SAFETY: the kernel hands the handler a valid ucontext or null.
    let (fault_ip, stack_pointer) = unsafe { extract_registers(ucontext) };
    // SAFETY: likewise for siginfo.
    let fault_address = unsafe { fault_address_of(sig_info) };
    let context = FaultContext {
        fault_ip,
        stack_pointer,
        fault_address,
    };

    let mut kind = FaultKind::from_signum(signum);
    let exhausted =
        kind == FaultKind::IllegalAccess && looks_like_stack_exhaustion(&context);
    if exhausted {
        kind = FaultKind::StackOverflow;
    }

    let stack = if exhausted {
        // The dead stack cannot be walked; report the frozen frame alone.
        CallStack::capture_frozen(config, &context)
    } else if fault_ip != 0 {
        CallStack::capture_from_fault(config, fault_ip)
    } else {
        CallStack::capture(config)
    };

    let role = fault_thread_role();
    let report = FailureReport::new(kind, "", Some(stack), role);
    report::print_report(&report);
    Ok(role)
}

/// Apply the recovery policy after the report is out. Primary thread: put
/// the saved dispositions back and re-raise, so the OS performs its normal
/// termination (core dumps included). Worker thread: end only that thread.
unsafe fn recover(signum: i32, role: Option<ThreadRole>) {
    restore_saved_dispositions();
    if role == Some(ThreadRole::Worker) {
        libc::pthread_exit(ptr::null_mut());
    }
    // Signals are delivered once. For a hardware fault, returning would
    // re-execute the faulting instruction anyway; for raise()d signals the
    // restored disposition never fires unless we re-raise.
    let _ = libc::raise(signum);
}

/// Best-effort restoration from inside the fault path. Slots are read, not
/// taken; the process is on its way out.
unsafe fn restore_saved_dispositions() {
    if !INIT_FINISHED.load(SeqCst) {
        return;
    }
    for index in 0..MAX_SIGNALS {
        // `INIT_FINISHED` is true so install is done mutating the array.
        if let Some((sig, action)) = SAVED_ACTIONS[index] {
            let _ = signal::sigaction(sig, &action);
        }
    }
}

fn fault_thread_role() -> ThreadRole {
    let primary = PRIMARY_PTHREAD.load(SeqCst);
    // SAFETY: pthread_self has no preconditions.
    let current = unsafe { libc::pthread_self() } as usize;
    if primary == 0 || primary == current {
        ThreadRole::Primary
    } else {
        ThreadRole::Worker
    }
}

/// An illegal access is reclassified as stack exhaustion when the faulting
/// address sits in the altstack guard page or within slack distance of the
/// faulting thread's stack pointer (stacks grow down into their guard).
fn looks_like_stack_exhaustion(context: &FaultContext) -> bool {
    if context.fault_address == 0 {
        return false;
    }
    let alt_base = ALT_STACK_BASE.load(SeqCst);
    if alt_base != 0 {
        let guard_start = alt_base.saturating_sub(page_size::get());
        if context.fault_address >= guard_start && context.fault_address < alt_base {
            return true;
        }
    }
    context.stack_pointer != 0
        && context.fault_address.abs_diff(context.stack_pointer) <= STACK_GUARD_SLACK
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn extract_registers(ucontext: *const ucontext_t) -> (usize, usize) {
    if ucontext.is_null() {
        return (0, 0);
    }
    let gregs = &(*ucontext).uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RSP as usize] as usize,
    )
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn extract_registers(ucontext: *const ucontext_t) -> (usize, usize) {
    if ucontext.is_null() {
        return (0, 0);
    }
    let mcontext = &(*ucontext).uc_mcontext;
    (mcontext.pc as usize, mcontext.sp as usize)
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn extract_registers(ucontext: *const ucontext_t) -> (usize, usize) {
    if ucontext.is_null() || (*ucontext).uc_mcontext.is_null() {
        return (0, 0);
    }
    let ss = &(*(*ucontext).uc_mcontext).__ss;
    (ss.__rip as usize, ss.__rsp as usize)
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn extract_registers(ucontext: *const ucontext_t) -> (usize, usize) {
    if ucontext.is_null() || (*ucontext).uc_mcontext.is_null() {
        return (0, 0);
    }
    let ss = &(*(*ucontext).uc_mcontext).__ss;
    (ss.__pc as usize, ss.__sp as usize)
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn extract_registers(_ucontext: *const ucontext_t) -> (usize, usize) {
    (0, 0)
}

unsafe fn fault_address_of(sig_info: *const siginfo_t) -> usize {
    if sig_info.is_null() {
        return 0;
    }
    #[cfg(target_os = "linux")]
    return (*sig_info).si_addr() as usize;
    #[cfg(not(target_os = "linux"))]
    return (*sig_info).si_addr as usize;
}
