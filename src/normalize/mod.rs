// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! Frame name cleanup and the noise-frame exclusion catalog.
//!
//! Cleanup is a sequence of pure text passes, applied in a fixed order, and
//! idempotent as a whole: normalizing an already-normalized name returns it
//! unchanged.

use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Clean a raw resolved name into something a reader can act on.
///
/// Passes, in order: demangle a still-mangled symbol, strip library
/// namespace noise, collapse balanced generic argument lists, and rename
/// the program's renamed entry symbol back to its conventional name.
pub fn cleanup_function_name(function: &str) -> String {
    let mut function = function.trim().to_string();

    if let Some(demangled) = Name::from(function.as_str()).demangle(DemangleOptions::name_only()) {
        if demangled != function {
            function = demangled;
        }
    }

    // Library namespace noise that hides the name the user wrote.
    for noise in [
        "std::",
        "core::",
        "alloc::",
        "__cxx11::",
        "__cxxabi::",
        "__cxxabiv1::",
        "[abi:cxx11]",
        "__1::",
    ] {
        function = function.replace(noise, "");
    }

    // A few verbose spellings renamed to their conventional aliases.
    for (verbose, short) in [
        ("basic_ostream", "ostream"),
        ("basic_istream", "istream"),
        ("basic_ofstream", "ofstream"),
        ("basic_ifstream", "ifstream"),
        ("basic_string", "string"),
    ] {
        function = function.replace(verbose, short);
    }

    function = collapse_generic_args(&function);

    // Trailing hash suffix some toolchains keep after demangling.
    if let Some(pos) = function.rfind("::h") {
        let tail = &function[pos + 3..];
        if tail.len() == 16 && tail.bytes().all(|b| b.is_ascii_hexdigit()) {
            function.truncate(pos);
        }
    }

    // The entry point gets renamed by launcher glue; show it as written.
    if function == "_main_" || function == "qMain" || function == "qMain()" {
        function = "main".to_string();
    } else if let Some(rest) = function.strip_prefix("Main(") {
        function = format!("main({rest}");
    }
    if function == "main(int, char**)" {
        function = "main()".to_string();
    }

    function
}

/// Collapse nested bracketed generic argument lists: `Map<K, V<T>>::insert`
/// becomes `Map::insert`. Only balanced lists are removed, so names like
/// `operator<<` pass through untouched.
fn collapse_generic_args(function: &str) -> String {
    let mut out: Vec<char> = function.chars().collect();
    let mut open = find_char(&out, '<', 0);
    while let Some(start) = open {
        let mut depth = 1usize;
        let mut end = start + 1;
        while end < out.len() {
            match out[end] {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            end += 1;
        }
        if depth == 0 {
            out.drain(start..=end);
            open = find_char(&out, '<', start);
        } else {
            // No matching close bracket; look past this one.
            open = find_char(&out, '<', start + 1);
        }
    }
    out.into_iter().collect()
}

fn find_char(chars: &[char], needle: char, from: usize) -> Option<usize> {
    chars[from.min(chars.len())..]
        .iter()
        .position(|&c| c == needle)
        .map(|i| i + from)
}

/// The tail of a path: `src/queue.rs` shows as `queue.rs`.
pub fn file_basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// The catalog of frames that would confuse rather than inform: interceptor
/// internals, thread-launch trampolines, runtime and loader plumbing. Static
/// and read-only after process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRules {
    names: Vec<String>,
    substrings: Vec<String>,
    prefixes: Vec<String>,
}

impl ExclusionRules {
    pub fn new(
        names: Vec<String>,
        substrings: Vec<String>,
        prefixes: Vec<String>,
    ) -> Self {
        Self {
            names,
            substrings,
            prefixes,
        }
    }

    /// Drop a frame whose cleaned name exactly matches a blacklisted name,
    /// contains a blacklisted substring, or starts with a blacklisted
    /// prefix. The exact-name check ignores the `()` the normalizer appends
    /// to parameterless names.
    pub fn is_excluded(&self, text: &str) -> bool {
        let bare = text.strip_suffix("()").unwrap_or(text);
        self.names.iter().any(|name| bare == name)
            || self.substrings.iter().any(|s| text.contains(s.as_str()))
            || self.prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }
}

impl Default for ExclusionRules {
    fn default() -> Self {
        let to_owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            names: to_owned(&[
                "",
                "??",
                "(unknown)",
                "clone",
                "_clone",
                "error",
                "__libc_start_main",
                "_start",
                "_Unwind_Resume",
                "rust_begin_unwind",
                "__rust_try",
            ]),
            substrings: to_owned(&[
                "faultline::capture",
                "faultline::interceptor",
                "faultline::report",
                "faultline::resolver",
                "faultline::callstack",
                "backtrace::backtrace",
                "panicking::",
                "panic_unwind::",
                "sys::backtrace",
                "rt::lang_start",
                "__rust_begin_short_backtrace",
                "FnOnce::call_once",
                "Builder::spawn_unchecked",
                "_sigtramp",
                "start_thread",
                "pthread_body",
                "pthread_start",
                "BaseThreadInitThunk",
                "RtlUserThreadStart",
                "capture/unix.rs",
                "capture/windows.rs",
                "interceptor/",
            ]),
            prefixes: to_owned(&["__cxa_", "__libc_", "__pthread"]),
        }
    }
}

/// Frames below the program's own entry point (runtime startup, OS loader)
/// are never shown; this recognizes where to stop.
pub fn is_entry_point(function: &str) -> bool {
    matches!(
        function,
        "main" | "main()" | "main(int, char**)" | "qMain" | "qMain()"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_is_idempotent() {
        for name in [
            "Vector<int>::get",
            "std::thread::spawn",
            "_ZN3Foo3barEv",
            "queue::Queue<T>::dequeue",
            "main(int, char**)",
            "operator<<",
        ] {
            let once = cleanup_function_name(name);
            let twice = cleanup_function_name(&once);
            assert_eq!(once, twice, "cleanup not idempotent for {name:?}");
        }
    }

    #[test]
    fn test_demangles_mangled_symbols() {
        assert_eq!(cleanup_function_name("_ZN3Foo3barEv"), "Foo::bar");
    }

    #[test]
    fn test_strips_namespace_noise() {
        assert_eq!(
            cleanup_function_name("std::__cxx11::to_string"),
            "to_string"
        );
    }

    #[test]
    fn test_renames_verbose_stream_types() {
        assert_eq!(
            cleanup_function_name("std::basic_ostream<char>::put"),
            "ostream::put"
        );
    }

    #[test]
    fn test_collapses_nested_generics() {
        assert_eq!(
            cleanup_function_name("Map<string, Vector<int>>::insert"),
            "Map::insert"
        );
        assert_eq!(
            collapse_generic_args("Grid<Grid<Cell<int>>>::at"),
            "Grid::at"
        );
    }

    #[test]
    fn test_unbalanced_bracket_left_alone() {
        assert_eq!(collapse_generic_args("operator<<"), "operator<<");
        assert_eq!(collapse_generic_args("operator<"), "operator<");
    }

    #[test]
    fn test_strips_rust_hash_suffix() {
        assert_eq!(
            cleanup_function_name("lang_start::h7a87e81ecc4a9d6c"),
            "lang_start"
        );
    }

    #[test]
    fn test_renamed_entry_symbol() {
        assert_eq!(cleanup_function_name("_main_"), "main");
        assert_eq!(cleanup_function_name("qMain"), "main");
        assert_eq!(cleanup_function_name("Main(int, char**)"), "main()");
    }

    #[test]
    fn test_file_basename() {
        assert_eq!(file_basename("/home/user/src/queue.rs"), "queue.rs");
        assert_eq!(file_basename("src\\queue.rs"), "queue.rs");
        assert_eq!(file_basename("queue.rs"), "queue.rs");
    }

    #[test]
    fn test_exclusion_exact_name_only() {
        let rules = ExclusionRules::new(
            vec!["dispatch_trampoline".to_string()],
            vec![],
            vec![],
        );
        assert!(rules.is_excluded("dispatch_trampoline"));
        assert!(rules.is_excluded("dispatch_trampoline()"));
        assert!(!rules.is_excluded("dispatch_trampoline_extra"));
        assert!(!rules.is_excluded("dispatch_trampoline_extra()"));
    }

    #[test]
    fn test_exclusion_substring_and_prefix() {
        let rules = ExclusionRules::new(
            vec![],
            vec!["::launcher::".to_string()],
            vec!["__glue_".to_string()],
        );
        assert!(rules.is_excluded("runtime::launcher::spawn"));
        assert!(rules.is_excluded("__glue_call"));
        assert!(!rules.is_excluded("launcher"));
    }

    #[test]
    fn test_default_rules_drop_runtime_plumbing() {
        let rules = ExclusionRules::default();
        assert!(rules.is_excluded(""));
        assert!(rules.is_excluded("__libc_start_main"));
        assert!(rules.is_excluded("rt::lang_start_internal"));
        assert!(rules.is_excluded("faultline::interceptor::handle_fault"));
        assert!(!rules.is_excluded("queue::Queue::dequeue"));
    }

    #[test]
    fn test_entry_point_recognition() {
        assert!(is_entry_point("main"));
        assert!(is_entry_point("main()"));
        assert!(is_entry_point("qMain()"));
        assert!(!is_entry_point("main_loop"));
    }
}
