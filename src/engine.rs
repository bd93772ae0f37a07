//! Interface to the external container engine.
//!
//! The engine is a system service that imports layers, manages volumes
//! and creates/starts/kills containers. The worker only ever talks to it
//! through the traits below; connections are cheap and disposable, so
//! callers connect per operation batch and drop the connection on any
//! unclassified fault (the reaper reconnects on its next pass).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Result alias for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Faults reported by the engine.
///
/// The named variants are the ones the worker reacts to specifically;
/// everything else travels as `Other` and is treated as fatal for the
/// operation (or as a reason to drop the connection, in the reaper).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The referenced container is not known to the engine.
    #[error("container does not exist: {0}")]
    ContainerDoesNotExist(String),

    /// The container is in a state that does not allow the operation,
    /// e.g. killing an already dead container.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A layer with the requested id was imported before.
    #[error("layer already exists: {0}")]
    LayerAlreadyExists(String),

    /// The engine connection failed or broke mid-operation.
    #[error("engine transport error: {0}")]
    Transport(String),

    /// Any other engine-reported error.
    #[error("engine error {name}: {message}")]
    Other { name: String, message: String },
}

/// Engine-reported container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Running,
    Stopped,
    Dead,
    Meta,
    Paused,
    /// A state string this worker does not interpret.
    Unknown(String),
}

impl FromStr for ContainerState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "starting" => ContainerState::Starting,
            "running" => ContainerState::Running,
            "stopped" => ContainerState::Stopped,
            "dead" => ContainerState::Dead,
            "meta" => ContainerState::Meta,
            "paused" => ContainerState::Paused,
            other => ContainerState::Unknown(other.to_string()),
        })
    }
}

/// A volume known to the engine.
#[derive(Debug, Clone)]
pub struct VolumeDesc {
    /// Mount path of the volume.
    pub path: PathBuf,
    /// Engine volume properties (backend, layers, private label, ...).
    pub properties: HashMap<String, String>,
}

/// Produces engine connections.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    /// Opens a fresh connection to the engine.
    async fn connect(&self) -> EngineResult<Box<dyn EngineConn>>;
}

/// One engine connection.
///
/// Implementations must be safe to drop at any point; the worker never
/// assumes a connection outlives the operation batch it was opened for.
#[async_trait]
pub trait EngineConn: Send + Sync {
    /// Absolute name of the namespace this worker runs in; container ids
    /// are created under it. `"/"` means the root namespace.
    async fn root_namespace(&self) -> EngineResult<String>;

    // =========================================================================
    // Layers
    // =========================================================================

    /// Imports a layer tarball under the given layer id.
    async fn import_layer(&self, id: &str, tarball: &Path) -> EngineResult<()>;

    /// Lists all layer ids known to the engine.
    async fn list_layers(&self) -> EngineResult<Vec<String>>;

    // =========================================================================
    // Containers
    // =========================================================================

    /// Lists all container ids known to the engine.
    async fn list_containers(&self) -> EngineResult<Vec<String>>;

    /// Creates an empty container.
    async fn create_container(&self, id: &str) -> EngineResult<()>;

    /// Sets one container property.
    async fn set_property(&self, id: &str, property: &str, value: &str) -> EngineResult<()>;

    /// Reads one container property.
    async fn get_property(&self, id: &str, property: &str) -> EngineResult<String>;

    /// Reads one container data field (e.g. accumulated `stdout`).
    async fn get_data(&self, id: &str, field: &str) -> EngineResult<String>;

    /// Reads a batch of properties for one container.
    async fn get_properties(
        &self,
        id: &str,
        properties: &[&str],
    ) -> EngineResult<HashMap<String, String>>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> EngineResult<()>;

    /// Sends a signal to the container's init process.
    async fn kill(&self, id: &str, signal: i32) -> EngineResult<()>;

    /// Waits until one of the containers reaches a terminal state or the
    /// timeout elapses; returns the id that turned, or an empty string
    /// on timeout.
    async fn wait(&self, ids: &[String], timeout: Duration) -> EngineResult<String>;

    /// Destroys a container.
    async fn destroy(&self, id: &str) -> EngineResult<()>;

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Creates a volume. `path` of `None` lets the engine pick one.
    async fn create_volume(
        &self,
        path: Option<&Path>,
        properties: &HashMap<String, String>,
    ) -> EngineResult<VolumeDesc>;

    /// Unlinks a volume from a container (`"***"` unlinks from all).
    async fn unlink_volume(&self, path: &Path, container: &str) -> EngineResult<()>;

    /// Lists all volumes with their properties.
    async fn list_volumes(&self) -> EngineResult<Vec<VolumeDesc>>;
}

/// SIGKILL, the only signal the worker sends.
pub const SIGKILL: i32 = 9;
