// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

//! The external resolver sub-process.
//!
//! The tool is invoked once per batch with the program's own binary path and
//! every address as a hexadecimal argument, interleaving the two strategies:
//! for input address `i`, argument `2i` is the raw address and argument
//! `2i+1` the module-relative one. The tool answers one line per argument,
//! in argument order; that positional contract is what lets the caller pair
//! output lines back to input addresses.

use crate::capture::RawAddress;
use anyhow::Context;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[cfg(target_os = "macos")]
const RESOLVER_TOOL: &str = "atos";
#[cfg(not(target_os = "macos"))]
const RESOLVER_TOOL: &str = "addr2line";

/// Build the batch invocation for this platform's resolver tool.
pub(crate) fn resolver_command(program: &str, addresses: &[RawAddress]) -> Command {
    let mut cmd = Command::new(RESOLVER_TOOL);
    #[cfg(target_os = "macos")]
    cmd.arg("-o").arg(program);
    // -f: function names, -i: inlined frames, -C: demangle, -s: basenames,
    // -p: pretty one-line output
    #[cfg(not(target_os = "macos"))]
    cmd.args(["-f", "-i", "-C", "-s", "-p", "-e"]).arg(program);
    for address in addresses {
        cmd.arg(format!("{:#x}", address.address));
        cmd.arg(format!("{:#x}", address.module_offset()));
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    cmd
}

/// Run the resolver tool and capture its stdout, bounded by `timeout`. A
/// missing or slow tool must not hang the diagnostic path; the caller turns
/// any error here into "no line info".
pub(crate) fn run_resolver_tool(
    program: &str,
    addresses: &[RawAddress],
    timeout: Duration,
) -> anyhow::Result<String> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let child = resolver_command(program, addresses)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .context("resolver tool timed out")?
            .context("failed to run resolver tool")?;
        // addr2line exits nonzero for some unresolvable inputs while still
        // printing usable lines, so the exit status is advisory only.
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_interleaves_strategies() {
        let addresses = vec![
            RawAddress {
                address: 0x5000,
                module_base: Some(0x4000),
            },
            RawAddress::new(0xabc),
        ];
        let cmd = resolver_command("/bin/prog", &addresses);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, &["0x5000", "0x1000", "0xabc", "0xabc"]);
        assert!(args.iter().any(|a| a == "/bin/prog"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_debug_info_less_binary_resolves_to_placeholders() -> anyhow::Result<()> {
        // An empty file has no symbol tables at all; whatever the tool says
        // about it must come back as failed resolutions, not garbage.
        let file = tempfile::NamedTempFile::new()?;
        let path = file.path().to_string_lossy().into_owned();
        let addresses = [RawAddress::new(0x1000)];
        if let Ok(output) = run_resolver_tool(&path, &addresses, Duration::from_secs(5)) {
            let lines: Vec<&str> = output.lines().collect();
            let best = super::super::best_of(
                lines.first().copied().unwrap_or_default(),
                lines.get(1).copied().unwrap_or_default(),
            );
            let (_, location) = super::super::parse_external_line(&best);
            assert!(location.is_empty());
        }
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_missing_tool_fails_soft() {
        // Point at a binary that cannot exist; the error must come back
        // within the timeout rather than hanging.
        let addresses = [RawAddress::new(0x1000)];
        let result = run_resolver_tool("/nonexistent/binary", &addresses, Duration::from_secs(2));
        // Either the tool is absent (spawn error) or it politely reports
        // failure; both are acceptable, hanging is not.
        match result {
            Ok(output) => assert!(output.len() < 4096),
            Err(_) => {}
        }
    }
}
