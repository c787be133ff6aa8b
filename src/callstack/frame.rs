// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use crate::normalize;
use crate::resolver::ResolvedLocation;
use serde::{Deserialize, Serialize};

/// One activation record on a captured call stack.
///
/// Created during capture, written once by the normalizer (name cleanup,
/// file basename), and never mutated after the stack is assembled. Any of
/// the resolved fields may be blank; a frame whose address could not be
/// resolved is retained with blank file and line rather than dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Raw captured instruction address.
    address: usize,
    /// Address relative to the owning module's load base.
    module_offset: usize,
    /// Symbol name as the resolver produced it, possibly still mangled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_symbol: Option<String>,
    /// Cleaned display name.
    function: String,
    /// Source file, shown as basename.
    file: String,
    /// Source line, 0 when unknown.
    line: u32,
    /// Raw `file:line` string from the resolver, already cleaned.
    location: String,
}

impl Frame {
    pub(crate) fn from_resolution(
        address: usize,
        module_offset: usize,
        resolved: ResolvedLocation,
    ) -> Self {
        let raw_symbol = (!resolved.function.is_empty()).then(|| resolved.function.clone());
        Self {
            address,
            module_offset,
            raw_symbol,
            function: resolved.function,
            file: resolved.file,
            line: resolved.line,
            location: resolved.location,
        }
    }

    /// Apply the normalizer's one permitted mutation: clean the display
    /// name, reduce the file to its basename, and regenerate the location
    /// string from them when the resolver produced none.
    pub(crate) fn normalize(&mut self) {
        self.function = normalize::cleanup_function_name(&self.function);
        // Resolved names without a parameter list read like variables;
        // append an empty one.
        if !self.function.is_empty() && !self.function.contains('(') {
            self.function.push_str("()");
        }
        self.file = normalize::file_basename(&self.file).to_string();
        if crate::resolver::is_placeholder(&self.location) {
            self.location.clear();
        }
        if self.location.is_empty() && !self.file.is_empty() && self.line > 0 {
            self.location = format!("{}:{}", self.file, self.line);
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn module_offset(&self) -> usize {
        self.module_offset
    }

    pub fn raw_symbol(&self) -> Option<&str> {
        self.raw_symbol.as_deref()
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// The `file:line` column as the report shows it: the resolver's cleaned
    /// location, a `line N` fallback when only a line number is known, blank
    /// otherwise.
    pub fn display_location(&self) -> String {
        if !self.location.is_empty() {
            self.location.clone()
        } else if self.line > 0 {
            format!("line {}", self.line)
        } else {
            String::new()
        }
    }

    #[cfg(test)]
    pub(crate) fn synthetic(function: &str, file: &str, line: u32) -> Self {
        let mut frame = Self {
            address: 0x1000,
            module_offset: 0x1000,
            raw_symbol: Some(function.to_string()),
            function: function.to_string(),
            file: file.to_string(),
            line,
            location: String::new(),
        };
        frame.normalize();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_appends_parens() {
        let frame = Frame::synthetic("process_queue", "src/queue.rs", 42);
        assert_eq!(frame.function(), "process_queue()");
        assert_eq!(frame.file(), "queue.rs");
        assert_eq!(frame.display_location(), "queue.rs:42");
    }

    #[test]
    fn test_normalize_is_write_once_stable() {
        let mut frame = Frame::synthetic("Vector<int>::get", "vector.h", 764);
        let before = frame.clone();
        frame.normalize();
        assert_eq!(frame, before);
    }

    #[test]
    fn test_unresolved_frame_is_blank_not_absent() {
        let frame = Frame::from_resolution(0xdead, 0xdead, ResolvedLocation::default());
        assert_eq!(frame.function(), "");
        assert_eq!(frame.file(), "");
        assert_eq!(frame.line(), 0);
        assert_eq!(frame.display_location(), "");
    }

    #[test]
    fn test_placeholder_location_cleared() {
        let mut frame = Frame::from_resolution(
            0x1,
            0x1,
            ResolvedLocation {
                function: "f".to_string(),
                file: String::new(),
                line: 0,
                location: "?? ??:0".to_string(),
            },
        );
        frame.normalize();
        assert_eq!(frame.location(), "");
        assert_eq!(frame.display_location(), "");
    }

    #[test]
    fn test_line_only_fallback() {
        let mut frame = Frame::from_resolution(
            0x1,
            0x1,
            ResolvedLocation {
                function: "f".to_string(),
                file: String::new(),
                line: 17,
                location: String::new(),
            },
        );
        frame.normalize();
        assert_eq!(frame.display_location(), "line 17");
    }
}
