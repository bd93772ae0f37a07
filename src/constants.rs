//! Constants for the isolation worker.
//!
//! Defaults, timeouts and protocol-fixed values live here so the rest
//! of the codebase stays free of magic numbers.

use std::time::Duration;

// =============================================================================
// Spawn Admission
// =============================================================================

/// Default number of concurrently executing spawns.
pub const DEFAULT_SPAWN_CONCURRENCY: u32 = 5;

/// Hard cap on spawns pending admission; above it new spawns are
/// rejected with a retryable error.
pub const SPAWN_QUEUE_LIMIT: i64 = 10;

// =============================================================================
// Dialing / Transport
// =============================================================================

/// Default number of extra connection attempts to a registry.
pub const DEFAULT_DIAL_RETRIES: u32 = 10;

/// Per-attempt TCP connect allowance.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of the random sleep between connection attempts.
pub const DIAL_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// TLS handshake allowance. The registry client bounds TCP connect and
/// TLS handshake as one phase, so this is added on top of
/// `DIAL_TIMEOUT` when the client is built.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle connection timeout for registry transports.
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Background Loops
// =============================================================================

/// Default sleep between reaper passes, seconds.
pub const DEFAULT_WAIT_LOOP_STEP_SEC: u64 = 10;

/// Pause before retrying a failed engine connection in the reaper.
pub const REAPER_RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Interval between periodic journal dumps.
pub const JOURNAL_DUMP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Container Lifecycle
// =============================================================================

/// How long to wait for a killed container to reach a terminal state.
pub const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Boundary marker written to a container's output sink once the
/// container has started; upstream treats it as the start notification.
pub const START_MARKER: &[u8] = &[0];

/// Default volume backend requested from the engine.
pub const DEFAULT_VOLUME_BACKEND: &str = "overlay";

/// Default `private` label stamped on app volumes; the GC pass unlinks
/// volumes carrying it.
pub const DEFAULT_APP_VOLUME_LABEL: &str = "cocaine-app";

/// Engine properties reported by `inspect`.
pub const INSPECT_PROPERTIES: &[&str] = &[
    "state",
    "root_path",
    "command",
    "env",
    "ip",
    "net",
    "time",
    "exit_status",
    "oom_killed",
    "stdout_offset",
    "stderr_offset",
];

// =============================================================================
// Download Helper
// =============================================================================

/// Outer per-layer deadline for a helper invocation.
pub const HELPER_LAYER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Base of the timeout passed to the helper command, seconds.
pub const HELPER_BASE_TIMEOUT_SECS: u64 = 300;

/// Extra helper seconds granted per started 100 MiB of layer size.
pub const HELPER_SECS_PER_CHUNK: u64 = 60;

/// Layer size granularity for the helper timeout computation.
pub const HELPER_CHUNK_BYTES: u64 = 100 * 1024 * 1024;
