// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform-specific stack capture.
//!
//! Each platform implements [`Unwinder`] and produces an ordered list of raw
//! addresses, innermost frame first. Capture never fails: a corrupted stack
//! yields a shorter (possibly empty) list, and captures that could not walk
//! the live stack are marked partial.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::nearest_symbol_of;
#[cfg(unix)]
pub(crate) use unix::PosixUnwinder as PlatformUnwinder;
#[cfg(windows)]
pub(crate) use windows::walk_seeded;
#[cfg(windows)]
pub(crate) use windows::SehUnwinder as PlatformUnwinder;

/// One raw captured address plus the load base of its owning module, when the
/// dynamic loader could tell us which module that is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress {
    pub address: usize,
    pub module_base: Option<usize>,
}

impl RawAddress {
    pub fn new(address: usize) -> Self {
        Self {
            address,
            module_base: None,
        }
    }

    /// The module-relative offset used by the resolver's second strategy.
    /// Falls back to the raw address when the owning module is unknown.
    pub fn module_offset(&self) -> usize {
        match self.module_base {
            Some(base) if self.address >= base => self.address - base,
            Some(base) => base - self.address,
            None => self.address,
        }
    }
}

/// The result of one capture. `partial` is set when the walker could not see
/// the whole stack (frozen fault context, depth cap hit mid-walk).
#[derive(Debug, Clone, Default)]
pub struct CapturedStack {
    pub addresses: Vec<RawAddress>,
    pub partial: bool,
}

/// A frozen record of the faulting CPU context, built by the signal handler
/// before any walking happens. For stack-exhaustion faults this is all the
/// capturer is allowed to look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultContext {
    /// Instruction pointer at the fault.
    pub fault_ip: usize,
    /// Stack pointer at the fault, 0 when unavailable.
    pub stack_pointer: usize,
    /// Faulting memory address from the OS fault record, 0 when unavailable.
    pub fault_address: usize,
}

/// Platform stack walker. Contract: never panics, never allocates
/// unboundedly, returns within bounded time even on a corrupted stack.
pub(crate) trait Unwinder {
    /// Walk the current execution context.
    fn walk_current(&self, max_frames: usize) -> CapturedStack;

    /// Walk the current context but drop every leading frame above the fault
    /// instruction pointer, so that handler internals do not show up.
    fn walk_from_fault(&self, fault_ip: usize, max_frames: usize) -> CapturedStack;

    /// Live walking is unsafe (stack exhausted); recover what the frozen
    /// context alone can give us. Always partial.
    fn walk_frozen(&self, context: &FaultContext) -> CapturedStack;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_offset_subtracts_base() {
        let a = RawAddress {
            address: 0x7f00_1000,
            module_base: Some(0x7f00_0000),
        };
        assert_eq!(a.module_offset(), 0x1000);
    }

    #[test]
    fn test_module_offset_without_base() {
        let a = RawAddress::new(0x4242);
        assert_eq!(a.module_offset(), 0x4242);
    }

    #[test]
    fn test_module_offset_base_above_address() {
        // Seen with PIE binaries where dladdr reports an unexpected base;
        // mirror the "subtract smaller from larger" recovery.
        let a = RawAddress {
            address: 0x1000,
            module_base: Some(0x4000),
        };
        assert_eq!(a.module_offset(), 0x3000);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_walk_current_is_bounded() {
        let unwinder = PlatformUnwinder;
        let captured = unwinder.walk_current(8);
        assert!(captured.addresses.len() <= 8);
        assert!(!captured.addresses.is_empty());
    }

    #[test]
    fn test_walk_frozen_is_partial() {
        let unwinder = PlatformUnwinder;
        let context = FaultContext {
            fault_ip: 0xdead_beef,
            stack_pointer: 0,
            fault_address: 0,
        };
        let captured = unwinder.walk_frozen(&context);
        assert!(captured.partial);
        assert_eq!(captured.addresses.len(), 1);
        assert_eq!(captured.addresses[0].address, 0xdead_beef);
    }
}
