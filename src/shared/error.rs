// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Structured error payload recognized by the uncaught-panic classifier.
///
/// User code that wants its failures reported with a kind label and a clean
/// message panics with one of these (`panic_any(FaultError::new(..))`)
/// instead of a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct FaultError {
    kind: String,
    message: String,
}

impl FaultError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_error_display() {
        let e = FaultError::new("index out of range");
        assert_eq!(e.to_string(), "index out of range");
        assert_eq!(e.kind(), "error");
    }

    #[test]
    fn test_fault_error_with_kind() {
        let e = FaultError::with_kind("precondition", "negative size");
        assert_eq!(e.kind(), "precondition");
        assert_eq!(e.message(), "negative size");
    }
}
