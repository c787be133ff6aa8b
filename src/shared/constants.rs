// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Hard cap on captured frames, so that a corrupted stack cannot make the
/// unwinder loop forever.
pub const DEFAULT_MAX_FRAMES: usize = 50;

/// Upper bound a configuration may raise `max_frames` to.
pub const MAX_FRAMES_LIMIT: usize = 256;

/// How long we are willing to wait for the external resolver tool before
/// falling back to "no line info".
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);

/// The line addr2line emits when it has nothing to say about an address.
pub const UNKNOWN_LOCATION_PLACEHOLDER: &str = "?? ??:0";

/// How long a worker thread waits after reporting an uncaught panic, so that
/// concurrently-buffered diagnostic output can flush before the thread exits.
pub const WORKER_FLUSH_WAIT: Duration = Duration::from_millis(100);
