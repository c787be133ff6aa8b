// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Failure report rendering and emission.
//!
//! Rendering is infallible by construction: it is pure text formatting over
//! already-validated data, with no I/O and no fallible conversions. The only
//! shared resource is the diagnostic stream itself, guarded by a mutex held
//! for the duration of one print call.

mod catalog;

pub use catalog::FaultKind;

use crate::callstack::CallStack;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, OnceLock};

/// Which kind of thread the failure happened on. The recovery policy hangs
/// off this: a primary-thread fault ends the process, a worker-thread fault
/// ends only that thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadRole {
    Primary,
    Worker,
}

/// One diagnosed failure, created once per fault and consumed immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    kind: FaultKind,
    message: String,
    stack: Option<CallStack>,
    thread_role: ThreadRole,
    uuid: String,
    timestamp: String,
}

/// Every report line starts with this, so diagnostic output stands out from
/// whatever the program itself was printing.
const LINE_PREFIX: &str = "***";

const FOOTER: &str = "To learn more about the crash, we strongly suggest \
running your program under the debugger.";

impl FailureReport {
    pub fn new(
        kind: FaultKind,
        message: impl Into<String>,
        stack: Option<CallStack>,
        thread_role: ThreadRole,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            stack,
            thread_role,
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&CallStack> {
        self.stack.as_ref()
    }

    pub fn thread_role(&self) -> ThreadRole {
        self.thread_role
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Render the whole report as star-prefixed text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        push_line(&mut out, "");
        push_line(
            &mut out,
            &format!("{} occurred during program execution.", self.kind.label()),
        );
        for line in self.kind.explanation().lines() {
            push_line(&mut out, line.trim_end());
        }
        if !self.message.is_empty() {
            push_line(&mut out, "");
            for line in self.message.lines() {
                push_line(&mut out, line);
            }
        }
        push_line(&mut out, "");
        push_line(
            &mut out,
            &format!("when: {}  id: {}", self.timestamp, self.uuid),
        );
        push_line(&mut out, &format!("os: {}", os_description()));

        if let Some(stack) = self.stack.as_ref().filter(|s| !s.is_empty()) {
            push_line(&mut out, "");
            push_line(&mut out, "Stack trace (line numbers are approximate):");
            render_stack(&mut out, stack);
            if stack.is_partial() {
                push_line(&mut out, "(partial stack; earlier frames unavailable)");
            }
        }

        push_line(&mut out, "");
        for line in wrap_text(FOOTER, 68) {
            push_line(&mut out, &line);
        }
        push_line(&mut out, "");
        out
    }
}

fn push_line(out: &mut String, text: &str) {
    out.push_str(LINE_PREFIX);
    if !text.is_empty() {
        out.push(' ');
        out.push_str(text);
    }
    out.push('\n');
}

/// Two left-aligned columns, `file:line` then function. Column width comes
/// from the widest location actually shown, not from the unfiltered set.
fn render_stack(out: &mut String, stack: &CallStack) {
    let locations: Vec<String> = stack
        .frames()
        .iter()
        .map(|frame| {
            let location = frame.display_location();
            if location.is_empty() {
                "(unknown)".to_string()
            } else {
                location
            }
        })
        .collect();
    let width = locations.iter().map(|l| l.len()).max().unwrap_or(0);
    for (frame, location) in stack.frames().iter().zip(locations) {
        push_line(&mut *out, &format!("{location:<width$}  {}", frame.function()));
    }
}

/// Greedy word wrap for the fixed footer text.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());
static OS_DESCRIPTION: OnceLock<String> = OnceLock::new();

/// The OS description line, computed once. Called at enable time so the
/// fault path finds it already cached.
pub(crate) fn os_description() -> &'static str {
    OS_DESCRIPTION.get_or_init(|| os_info::get().to_string())
}

/// Print a stack trace block on its own, outside any failure report. Used
/// by the on-demand stack dump.
pub fn print_stack(stack: &CallStack) {
    let mut out = String::with_capacity(256);
    push_line(&mut out, "Stack trace (line numbers are approximate):");
    if stack.is_empty() {
        push_line(&mut out, "(no frames captured)");
    } else {
        render_stack(&mut out, stack);
        if stack.is_partial() {
            push_line(&mut out, "(partial stack; earlier frames unavailable)");
        }
    }
    let _guard = OUTPUT_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    eprint!("{out}");
}

/// Write one report to the diagnostic stream. The lock is held only for the
/// print itself; a poisoned lock still prints, a crashing process has no
/// business being precious about poison.
pub fn print_report(report: &FailureReport) {
    let rendered = report.render();
    let _guard = OUTPUT_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    eprint!("{rendered}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::Frame;
    use crate::normalize::ExclusionRules;

    fn stack_of(frames: Vec<Frame>) -> CallStack {
        CallStack::from_frames(frames, false)
    }

    #[test]
    fn test_every_line_is_star_prefixed() {
        let report = FailureReport::new(
            FaultKind::Arithmetic,
            "",
            Some(stack_of(vec![Frame::synthetic("divide", "math.rs", 7)])),
            ThreadRole::Primary,
        );
        for line in report.render().lines() {
            assert!(line.starts_with("***"), "unprefixed line: {line:?}");
        }
    }

    #[test]
    fn test_arithmetic_report_wording() {
        let report =
            FailureReport::new(FaultKind::Arithmetic, "", None, ThreadRole::Primary);
        let text = report.render();
        assert!(text.to_lowercase().contains("arithmetic"));
        assert!(text.contains("divide") || text.contains("overflow"));
    }

    #[test]
    fn test_columns_align_on_widest_shown_location() {
        let report = FailureReport::new(
            FaultKind::IllegalAccess,
            "",
            Some(stack_of(vec![
                Frame::synthetic("top", "a.rs", 5),
                Frame::synthetic("very_long_caller", "deeply_nested_module.rs", 1234),
            ])),
            ThreadRole::Worker,
        );
        let text = report.render();
        let rows: Vec<&str> = text
            .lines()
            .filter(|l| l.contains("top()") || l.contains("very_long_caller()"))
            .collect();
        assert_eq!(rows.len(), 2);
        let col = |row: &str, name: &str| row.find(name).unwrap();
        assert_eq!(
            col(rows[0], "top()"),
            col(rows[1], "very_long_caller()"),
            "function column not aligned:\n{}\n{}",
            rows[0],
            rows[1]
        );
    }

    #[test]
    fn test_empty_stack_omits_stack_section() {
        let report = FailureReport::new(
            FaultKind::IllegalAccess,
            "",
            Some(stack_of(vec![])),
            ThreadRole::Primary,
        );
        let text = report.render();
        assert!(!text.contains("Stack trace"));
        assert!(text.contains("segmentation fault"));
        assert!(text.contains("debugger"));
    }

    #[test]
    fn test_multiline_message_star_prefixed() {
        let report = FailureReport::new(
            FaultKind::UncaughtException,
            "first line\nsecond line",
            None,
            ThreadRole::Worker,
        );
        let text = report.render();
        assert!(text.contains("*** first line\n"));
        assert!(text.contains("*** second line\n"));
    }

    #[test]
    fn test_unknown_location_placeholder_rendered() {
        let report = FailureReport::new(
            FaultKind::IllegalAccess,
            "",
            Some(stack_of(vec![Frame::synthetic("mystery", "", 0)])),
            ThreadRole::Primary,
        );
        assert!(report.render().contains("(unknown)"));
    }

    #[test]
    fn test_partial_stack_marker() {
        let stack = CallStack::from_frames(vec![Frame::synthetic("f", "f.rs", 1)], true);
        let report =
            FailureReport::new(FaultKind::StackOverflow, "", Some(stack), ThreadRole::Primary);
        assert!(report.render().contains("partial stack"));
    }

    #[test]
    fn test_exact_exclusion_reaches_rendered_report() {
        let rules = ExclusionRules::new(
            vec!["dispatch_trampoline".to_string()],
            vec![],
            vec![],
        );
        let frames = crate::callstack::filter_frames(
            vec![
                Frame::synthetic("user_code", "user.rs", 3),
                Frame::synthetic("dispatch_trampoline", "glue.rs", 9),
                Frame::synthetic("dispatch_trampoline_extra", "glue.rs", 11),
            ],
            &rules,
        );
        let report = FailureReport::new(
            FaultKind::Abort,
            "",
            Some(stack_of(frames)),
            ThreadRole::Worker,
        );
        let text = report.render();
        assert!(!text.contains("dispatch_trampoline()"));
        assert!(text.contains("dispatch_trampoline_extra()"));
    }
}
