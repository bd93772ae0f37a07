//! Error types for the isolation worker.

use crate::engine::EngineError;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching, spooling and spawning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Admission / Cancellation
    // =========================================================================
    /// Spawn queue is saturated; the client may retry.
    #[error("try again later")]
    TryAgainLater,

    /// Spawn was canceled while waiting for a slot.
    #[error("spawning has been canceled")]
    SpawnCanceled,

    /// Operation canceled by its session context.
    #[error("operation canceled")]
    Canceled,

    // =========================================================================
    // Request-Level Errors
    // =========================================================================
    /// The profile carries no isolation type.
    #[error("the profile does not have `type` option")]
    MissingProfileType,

    /// No box is registered for the requested isolation type.
    #[error("isolate type {0} is not available")]
    UnknownIsolateType(String),

    /// Opcode not recognized in the current dispatch state.
    #[error("unknown transition id: {0}")]
    UnknownTransition(u32),

    /// Message arguments could not be unpacked into the expected shape.
    #[error("unable to unpack args: {0}")]
    InvalidArgs(String),

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Invalid or missing box configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Spool / Spawn Resource Errors
    // =========================================================================
    /// The journal holds no layers for the requested app.
    #[error("no layers in the journal for the app")]
    NoJournalLayers,

    /// The profile names no registry to pull from.
    #[error("registry must be non empty")]
    RegistryRequired,

    /// Manifest is neither a known v1 nor v2 schema.
    #[error("unknown manifest type: {0}")]
    UnknownManifest(String),

    /// Downloaded layer content does not hash to the declared digest.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// Image reference could not be parsed.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Registry interaction failed.
    #[error("registry error for '{reference}': {reason}")]
    Registry { reference: String, reason: String },

    /// Download helper invocation failed.
    #[error("download helper failed: {0}")]
    Helper(String),

    /// Network allocation binding failed.
    #[error("unable to bind network allocation for netid {net_id}: {reason}")]
    NetBinding { net_id: String, reason: String },

    // =========================================================================
    // External Faults
    // =========================================================================
    /// Container engine fault.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O fault.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization fault.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True when the client is expected to retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TryAgainLater)
    }
}
