// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use super::{CapturedStack, FaultContext, RawAddress, Unwinder};

/// Walks the stack through the runtime backtrace facility and asks the
/// dynamic loader which module owns each address.
///
/// SIGNAL SAFETY:
///     Getting a backtrace is not formally guaranteed to be signal safe.
///     Collecting bare instruction pointers is safe in practice; resolving
///     them is not, which is why this module never resolves anything.
pub(crate) struct PosixUnwinder;

impl Unwinder for PosixUnwinder {
    fn walk_current(&self, max_frames: usize) -> CapturedStack {
        self.walk_impl(None, max_frames)
    }

    fn walk_from_fault(&self, fault_ip: usize, max_frames: usize) -> CapturedStack {
        self.walk_impl(Some(fault_ip), max_frames)
    }

    fn walk_frozen(&self, context: &FaultContext) -> CapturedStack {
        // The live stack is unusable (exhausted or corrupted); the one thing
        // the frozen context can still tell us is where execution stopped.
        CapturedStack {
            addresses: vec![RawAddress {
                address: context.fault_ip,
                module_base: module_base_of(context.fault_ip),
            }],
            partial: true,
        }
    }
}

impl PosixUnwinder {
    fn walk_impl(&self, fault_ip: Option<usize>, max_frames: usize) -> CapturedStack {
        let mut addresses = Vec::with_capacity(max_frames);
        // Until the fault ip is seen, frames belong to the interceptor and
        // the backtrace machinery itself and are skipped. If it never shows
        // up (tail-call, ip fixup), fall back to keeping everything.
        let mut ip_found = fault_ip.is_none();
        let mut truncated = false;
        loop {
            // SAFETY: no other thread unwinds concurrently; the interceptor
            // serializes fault handling before calling into the capturer.
            unsafe {
                backtrace::trace_unsynchronized(|frame| {
                    let ip = frame.ip() as usize;
                    if Some(ip) == fault_ip {
                        ip_found = true;
                    }
                    if !ip_found {
                        return true;
                    }
                    if addresses.len() >= max_frames {
                        truncated = true;
                        return false;
                    }
                    addresses.push(RawAddress {
                        address: ip,
                        module_base: frame
                            .module_base_address()
                            .map(|base| base as usize)
                            .or_else(|| module_base_of(ip)),
                    });
                    true
                });
            }
            if ip_found {
                break;
            }
            // Capture something at all if the crashing frame was not found.
            ip_found = true;
        }
        CapturedStack {
            addresses,
            partial: truncated,
        }
    }
}

/// Load base of the module owning `address`, via the dynamic loader.
pub(crate) fn module_base_of(address: usize) -> Option<usize> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only reads the address and fills the out-struct.
    let rval = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
    if rval == 0 || info.dli_fbase.is_null() {
        None
    } else {
        Some(info.dli_fbase as usize)
    }
}

/// Nearest symbol name below `address`, still mangled, via the dynamic
/// loader. Used by the in-process resolution path.
pub(crate) fn nearest_symbol_of(address: usize) -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only reads the address and fills the out-struct.
    let rval = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
    if rval == 0 || info.dli_sname.is_null() {
        return None;
    }
    // SAFETY: dli_sname is a NUL-terminated string owned by the loader.
    let name = unsafe { std::ffi::CStr::from_ptr(info.dli_sname) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_walk_depth_cap_marks_partial() {
        let unwinder = PosixUnwinder;
        let captured = unwinder.walk_current(1);
        assert_eq!(captured.addresses.len(), 1);
        assert!(captured.partial);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_addresses_have_module_base() {
        let unwinder = PosixUnwinder;
        let captured = unwinder.walk_current(16);
        // At least the frames inside our own test binary must resolve to an
        // owning module.
        assert!(captured
            .addresses
            .iter()
            .any(|a| a.module_base.is_some()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_nearest_symbol_of_known_function() {
        let addr = module_base_of as usize;
        let symbol = nearest_symbol_of(addr);
        assert!(symbol.is_some());
    }
}
