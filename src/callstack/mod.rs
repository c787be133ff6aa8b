// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Assembly of captured addresses into one immutable, filtered stack.
//!
//! The pipeline is strictly capture → resolve → normalize → filter →
//! truncate. Filtering only removes frames; it never reorders or injects,
//! and once the program's own entry point is recognized everything deeper
//! (runtime startup, OS loader) is cut off.

mod frame;

pub use frame::Frame;

use crate::capture::{CapturedStack, FaultContext, PlatformUnwinder, Unwinder};
use crate::normalize::{self, ExclusionRules};
use crate::resolver;
use crate::shared::configuration::DiagnosticsConfiguration;
use serde::{Deserialize, Serialize};

/// An ordered, captured snapshot of one thread's call stack, innermost
/// frame first. Immutable once assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStack {
    frames: Vec<Frame>,
    partial: bool,
}

impl CallStack {
    /// Capture and assemble the current execution context.
    pub fn capture(config: &DiagnosticsConfiguration) -> Self {
        let captured = PlatformUnwinder.walk_current(config.max_frames());
        Self::assemble(config, captured)
    }

    /// Capture starting at the faulting instruction, dropping interceptor
    /// internals above it.
    pub(crate) fn capture_from_fault(config: &DiagnosticsConfiguration, fault_ip: usize) -> Self {
        let captured = PlatformUnwinder.walk_from_fault(fault_ip, config.max_frames());
        Self::assemble(config, captured)
    }

    /// Assemble from a frozen fault context when live walking is unsafe.
    pub(crate) fn capture_frozen(
        config: &DiagnosticsConfiguration,
        context: &FaultContext,
    ) -> Self {
        let captured = PlatformUnwinder.walk_frozen(context);
        Self::assemble(config, captured)
    }

    /// Assemble a stack from already-captured addresses. Used directly when
    /// the capture came from somewhere other than the live walkers.
    pub(crate) fn assemble(config: &DiagnosticsConfiguration, captured: CapturedStack) -> Self {
        let resolved = resolver::resolve_addresses(config, &captured.addresses);
        let mut frames: Vec<Frame> = captured
            .addresses
            .iter()
            .zip(resolved)
            .map(|(address, resolution)| {
                let mut frame = Frame::from_resolution(
                    address.address,
                    address.module_offset(),
                    resolution,
                );
                frame.normalize();
                frame
            })
            .collect();
        if config.filter_frames() {
            frames = filter_frames(frames, &ExclusionRules::default());
        }
        Self {
            frames,
            partial: captured.partial,
        }
    }

    pub(crate) fn from_frames(frames: Vec<Frame>, partial: bool) -> Self {
        Self { frames, partial }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when the capturer could not see the whole stack.
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

impl<'a> IntoIterator for &'a CallStack {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// Apply the exclusion catalog and entry-point truncation. Pure: the result
/// is a subsequence of the input ending at the entry point if one appears.
/// Idempotent: filtering an already-filtered sequence returns it unchanged.
pub(crate) fn filter_frames(frames: Vec<Frame>, rules: &ExclusionRules) -> Vec<Frame> {
    let mut kept = Vec::with_capacity(frames.len());
    for frame in frames {
        // Blank file/location means resolution failed, not that the frame
        // matches the blank-name rule; such frames are retained.
        if rules.is_excluded(frame.function())
            || (!frame.file().is_empty() && rules.is_excluded(frame.file()))
            || (!frame.location().is_empty() && rules.is_excluded(frame.location()))
        {
            continue;
        }
        let at_entry = normalize::is_entry_point(frame.function());
        kept.push(frame);
        if at_entry {
            break;
        }
    }
    kept
}
