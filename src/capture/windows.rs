// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use super::{CapturedStack, FaultContext, RawAddress, Unwinder};
use std::ffi::c_void;
use windows::Win32::System::Diagnostics::Debug::{
    AddrModeFlat, RtlCaptureContext, StackWalk64, SymFunctionTableAccess64, SymGetModuleBase64,
    CONTEXT, STACKFRAME64,
};
use windows::Win32::System::SystemInformation::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_ARM64,
};
use windows::Win32::System::Threading::{GetCurrentProcess, GetCurrentThread};

/// Walks the stack through the structured stack-walking API, seeded either
/// from a freshly captured register context or from the context record the
/// exception dispatcher froze at fault time.
pub(crate) struct SehUnwinder;

impl Unwinder for SehUnwinder {
    fn walk_current(&self, max_frames: usize) -> CapturedStack {
        let mut context = CONTEXT::default();
        // SAFETY: RtlCaptureContext fills the out-struct for the current
        // thread and has no other effects.
        unsafe { RtlCaptureContext(&mut context) };
        walk_with_context(&mut context, max_frames, false)
    }

    fn walk_from_fault(&self, fault_ip: usize, max_frames: usize) -> CapturedStack {
        let mut captured = self.walk_current(max_frames);
        // Drop handler internals above the fault ip when it is present.
        if let Some(pos) = captured
            .addresses
            .iter()
            .position(|a| a.address == fault_ip)
        {
            captured.addresses.drain(..pos);
        }
        captured
    }

    fn walk_frozen(&self, context: &FaultContext) -> CapturedStack {
        CapturedStack {
            addresses: vec![RawAddress::new(context.fault_ip)],
            partial: true,
        }
    }
}

/// Walk a register context the exception dispatcher froze at fault time.
/// The walk starts at the faulting frame itself, so filter internals never
/// show up. The caller passes a copy; walking mutates the context.
pub(crate) fn walk_seeded(context: &mut CONTEXT, max_frames: usize) -> CapturedStack {
    walk_with_context(context, max_frames, false)
}

fn walk_with_context(context: &mut CONTEXT, max_frames: usize, partial: bool) -> CapturedStack {
    let mut frame = STACKFRAME64::default();
    frame.AddrPC.Mode = AddrModeFlat;
    frame.AddrStack.Mode = AddrModeFlat;
    frame.AddrFrame.Mode = AddrModeFlat;

    #[cfg(target_arch = "x86_64")]
    let machine = IMAGE_FILE_MACHINE_AMD64;
    #[cfg(target_arch = "x86_64")]
    {
        frame.AddrPC.Offset = context.Rip;
        frame.AddrStack.Offset = context.Rsp;
        frame.AddrFrame.Offset = context.Rbp;
    }
    #[cfg(target_arch = "aarch64")]
    let machine = IMAGE_FILE_MACHINE_ARM64;
    #[cfg(target_arch = "aarch64")]
    {
        frame.AddrPC.Offset = context.Pc;
        frame.AddrStack.Offset = context.Sp;
        frame.AddrFrame.Offset = context.Anonymous.Anonymous.Fp;
    }

    let mut addresses = Vec::with_capacity(max_frames);
    // SAFETY: process/thread pseudo-handles are always valid; StackWalk64
    // only reads the context and frame structs between iterations.
    unsafe {
        let process = GetCurrentProcess();
        let thread = GetCurrentThread();
        while addresses.len() < max_frames {
            let ok = StackWalk64(
                machine.0 as u32,
                process,
                thread,
                &mut frame,
                context as *mut CONTEXT as *mut c_void,
                None,
                Some(SymFunctionTableAccess64),
                Some(SymGetModuleBase64),
                None,
            );
            if !ok.as_bool() || frame.AddrPC.Offset == 0 {
                break;
            }
            let address = frame.AddrPC.Offset as usize;
            let base = SymGetModuleBase64(process, frame.AddrPC.Offset) as usize;
            addresses.push(RawAddress {
                address,
                module_base: (base != 0).then_some(base),
            });
        }
    }
    CapturedStack { addresses, partial }
}
