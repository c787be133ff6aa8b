// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Best-effort address-to-source resolution.
//!
//! Two paths exist: querying the loaded debug symbol tables in-process, and
//! invoking the external resolver tool once per batch. The external tool is
//! probed with two address strategies per frame, because no single strategy
//! is reliable across toolchains: the raw address as captured, and the
//! address minus the owning module's load base. Whichever yields the longer
//! non-placeholder answer wins.
//!
//! Resolution failure is never an error. An address that cannot be resolved
//! produces a `ResolvedLocation` with blank fields, in its input position;
//! output order always matches input order.

mod tool;

use crate::capture::RawAddress;
use crate::shared::configuration::{DiagnosticsConfiguration, FrameResolution};
use crate::shared::constants::UNKNOWN_LOCATION_PLACEHOLDER;
use std::ffi::c_void;

/// What we know about one address after resolution. Any field may be blank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub function: String,
    pub file: String,
    pub line: u32,
    /// Cleaned `file:line` display string from the external tool, when any.
    pub location: String,
}

/// Resolve a batch of addresses. The returned vector has exactly one entry
/// per input address, in input order.
pub(crate) fn resolve_addresses(
    config: &DiagnosticsConfiguration,
    addresses: &[RawAddress],
) -> Vec<ResolvedLocation> {
    let mut resolved: Vec<ResolvedLocation> = match config.resolve_frames() {
        FrameResolution::Disabled | FrameResolution::ExternalTool => {
            vec![ResolvedLocation::default(); addresses.len()]
        }
        FrameResolution::InProcess | FrameResolution::Full => {
            addresses.iter().map(resolve_in_process).collect()
        }
    };

    if addresses.is_empty()
        || matches!(
            config.resolve_frames(),
            FrameResolution::Disabled | FrameResolution::InProcess
        )
    {
        return resolved;
    }

    let Some(program) = config.program_path() else {
        log::debug!("no program path configured, skipping external resolver");
        return resolved;
    };

    match tool::run_resolver_tool(program, addresses, config.resolver_timeout()) {
        Ok(output) => {
            let lines: Vec<&str> = output.lines().collect();
            for (i, slot) in resolved.iter_mut().enumerate() {
                // Line 2i resolves the raw address, line 2i+1 the
                // module-relative one; positions past the output are treated
                // as failed resolutions.
                let opt1 = lines.get(2 * i).copied().unwrap_or_default();
                let opt2 = lines.get(2 * i + 1).copied().unwrap_or_default();
                let best = best_of(opt1, opt2);
                merge_external(slot, &best);
            }
        }
        Err(e) => {
            // Fail soft into "no line info".
            log::warn!("external resolver failed: {e:#}");
        }
    }
    resolved
}

fn resolve_in_process(address: &RawAddress) -> ResolvedLocation {
    let mut loc = ResolvedLocation::default();
    // SAFETY: fault handling is serialized by the interceptor; nothing else
    // unwinds or resolves concurrently.
    unsafe {
        backtrace::resolve_unsynchronized(address.address as *mut c_void, |symbol| {
            if loc.function.is_empty() {
                if let Some(name) = symbol.name() {
                    loc.function = name.to_string();
                }
            }
            if let Some(file) = symbol.filename() {
                loc.file = file.display().to_string();
            }
            if let Some(line) = symbol.lineno() {
                loc.line = line;
            }
        });
    }
    #[cfg(unix)]
    if loc.function.is_empty() {
        if let Some(symbol) = crate::capture::nearest_symbol_of(address.address) {
            loc.function = symbol;
        }
    }
    loc
}

/// Pick the better of the two per-strategy resolver answers. The losing
/// strategy emits short placeholder lines, so longer wins; two placeholders
/// mean the address simply has no line info.
pub(crate) fn best_of(opt1: &str, opt2: &str) -> String {
    match (is_placeholder(opt1), is_placeholder(opt2)) {
        (true, true) => String::new(),
        (true, false) => opt2.to_string(),
        (false, true) => opt1.to_string(),
        (false, false) => {
            if opt1.len() >= opt2.len() {
                opt1.to_string()
            } else {
                opt2.to_string()
            }
        }
    }
}

/// A line equal to the "unknown" placeholder is a failed resolution, not a
/// valid empty location.
pub(crate) fn is_placeholder(line: &str) -> bool {
    let line = line.trim();
    line.is_empty()
        || line == UNKNOWN_LOCATION_PLACEHOLDER
        || line == "??"
        || line == "??:0"
        || line == "??:?"
        || line.starts_with("?? ")
}

/// Fold one parsed external-resolver line into an in-process result. The
/// external tool owns the location string; it only supplies the function
/// name when the symbol tables had none.
fn merge_external(slot: &mut ResolvedLocation, line: &str) {
    if line.is_empty() {
        return;
    }
    let (function, location) = parse_external_line(line);
    if !location.is_empty() {
        slot.location = location;
        if slot.line == 0 {
            if let Some(line_no) = trailing_line_number(&slot.location) {
                slot.line = line_no;
            }
        }
    }
    if (slot.function.is_empty() || slot.function == "(unknown)") && !function.is_empty() {
        slot.function = function;
    }
}

/// Split one resolver output line into (function, cleaned location).
///
/// Both platform shapes are understood:
///   `<function> at <file>:<line>`               (addr2line -f -p)
///   `<function> (in <module>) (<file>:<line>)`  (atos)
pub(crate) fn parse_external_line(line: &str) -> (String, String) {
    let line = line.trim();
    if is_placeholder(line) {
        return (String::new(), String::new());
    }
    if let Some(at) = line.rfind(" at ") {
        let function = line[..at].trim().to_string();
        let location = clean_location(&line[at + 4..]);
        return (function, location);
    }
    if let Some(in_module) = line.find(" (in ") {
        let function = line[..in_module].trim().to_string();
        // Without debug info the tool stops after the module name; the last
        // parenthesized chunk is a location only when it ends in a line
        // number, otherwise it is the `(in <module>)` marker itself.
        let location = match (line.rfind('('), line.rfind(')')) {
            (Some(open), Some(close)) if open + 1 < close => {
                let candidate = clean_location(&line[open + 1..close]);
                if trailing_line_number(&candidate).is_some() {
                    candidate
                } else {
                    String::new()
                }
            }
            _ => String::new(),
        };
        return (function, location);
    }
    // No recognized marker: a bare location if it looks like one, otherwise
    // a bare function name.
    if line.contains(':') && trailing_line_number(line).is_some() {
        (String::new(), clean_location(line))
    } else {
        (line.to_string(), String::new())
    }
}

/// Strip directories and trailing parenthesized extras from a location
/// string, leaving `file:line`.
fn clean_location(location: &str) -> String {
    let mut location = location.trim();
    if let Some(extra) = location.rfind(" (") {
        location = location[..extra].trim_end();
    }
    if let Some(slash) = location.rfind('/') {
        location = &location[slash + 1..];
    }
    if is_placeholder(location) {
        return String::new();
    }
    location.to_string()
}

fn trailing_line_number(location: &str) -> Option<u32> {
    location.rsplit(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::configuration::DiagnosticsConfiguration;

    #[test]
    fn test_parse_gnu_shape() {
        let (function, location) =
            parse_external_line("_Z4Mainv at /home/user/project/src/mainfunc.cpp:131");
        assert_eq!(function, "_Z4Mainv");
        assert_eq!(location, "mainfunc.cpp:131");
    }

    #[test]
    fn test_parse_gnu_shape_with_discriminator() {
        let (function, location) =
            parse_external_line("helper at /src/util.cpp:12 (discriminator 3)");
        assert_eq!(function, "helper");
        assert_eq!(location, "util.cpp:12");
    }

    #[test]
    fn test_parse_atos_shape() {
        let (function, location) = parse_external_line(
            "Vector<int>::checkIndex(int) const (in SampleProject) (vector.h:764)",
        );
        assert_eq!(function, "Vector<int>::checkIndex(int) const");
        assert_eq!(location, "vector.h:764");
    }

    #[test]
    fn test_parse_atos_shape_without_source_info() {
        // A stripped binary yields only the module marker; the module name
        // must not leak into the location column.
        let (function, location) = parse_external_line("main (in SampleProject) + 48");
        assert_eq!(function, "main");
        assert_eq!(location, "");

        let (function, location) = parse_external_line("helper (in SampleProject)");
        assert_eq!(function, "helper");
        assert_eq!(location, "");
    }

    #[test]
    fn test_parse_placeholder_is_failure() {
        assert_eq!(
            parse_external_line("?? ??:0"),
            (String::new(), String::new())
        );
        assert!(is_placeholder("?? ??:0"));
        assert!(is_placeholder("??"));
        assert!(is_placeholder(""));
        assert!(!is_placeholder("main at main.cpp:3"));
    }

    #[test]
    fn test_best_of_longer_wins() {
        assert_eq!(
            best_of("main at main.cpp:3", "doSomething at helpers/sort.cpp:118"),
            "doSomething at helpers/sort.cpp:118"
        );
    }

    #[test]
    fn test_best_of_placeholder_loses_regardless_of_length() {
        assert_eq!(best_of("?? ??:0", "main at main.cpp:3"), "main at main.cpp:3");
        assert_eq!(best_of("main at main.cpp:3", "?? ??:0"), "main at main.cpp:3");
    }

    #[test]
    fn test_best_of_two_placeholders_is_blank() {
        assert_eq!(best_of("?? ??:0", "??"), "");
    }

    #[test]
    fn test_merge_prefers_in_process_function() {
        let mut slot = ResolvedLocation {
            function: "alpha::beta()".to_string(),
            ..Default::default()
        };
        merge_external(&mut slot, "_ZN5alpha4betaEv at /src/alpha.cpp:9");
        assert_eq!(slot.function, "alpha::beta()");
        assert_eq!(slot.location, "alpha.cpp:9");
        assert_eq!(slot.line, 9);
    }

    #[test]
    fn test_merge_fills_missing_function() {
        let mut slot = ResolvedLocation::default();
        merge_external(&mut slot, "gamma at /src/gamma.cpp:21");
        assert_eq!(slot.function, "gamma");
        assert_eq!(slot.line, 21);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_batch_output_matches_input_length() {
        // No program path: external path skipped, in-process path only; the
        // positional contract must hold for any N including 0.
        let config = DiagnosticsConfiguration::default();
        for n in [0usize, 1, 3] {
            let addresses: Vec<_> = (0..n)
                .map(|i| crate::capture::RawAddress::new(0x1000 + i))
                .collect();
            let resolved = resolve_addresses(&config, &addresses);
            assert_eq!(resolved.len(), n);
        }
    }

    #[test]
    fn test_line_pairing_order() {
        // Simulate the per-address pairing over a synthetic tool output.
        let output = "a at /s/a.cpp:1\n?? ??:0\n?? ??:0\nb at /s/b.cpp:2\nc at /s/c.cpp:3\n?? ??:0";
        let lines: Vec<&str> = output.lines().collect();
        let mut got = Vec::new();
        for i in 0..3 {
            let opt1 = lines.get(2 * i).copied().unwrap_or_default();
            let opt2 = lines.get(2 * i + 1).copied().unwrap_or_default();
            got.push(parse_external_line(&best_of(opt1, opt2)).1);
        }
        assert_eq!(got, vec!["a.cpp:1", "b.cpp:2", "c.cpp:3"]);
    }
}
