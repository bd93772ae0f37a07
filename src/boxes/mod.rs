//! Isolation boxes.
//!
//! A box owns everything needed to run workers of one isolation type:
//! image spooling, container spawning, liveness tracking. The session
//! dispatcher resolves the profile's `type` option against the registry
//! and talks to the box through the [`IsolateBox`] trait only.

pub mod engine;

use crate::error::Result;
use crate::profile::{Profile, SpawnConfig};
use crate::protocol::OutputSender;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use self::engine::EngineBox;

/// A live worker container, as seen by the session.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Kills the worker and reclaims its resources. Killing an already
    /// dead worker succeeds.
    async fn kill(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProcessHandle")
    }
}

/// One isolation backend.
#[async_trait]
pub trait IsolateBox: Send + Sync {
    /// Materializes the app image so spawns can reference it. Must
    /// honor `token`: cancellation aborts in-flight downloads.
    async fn spool(&self, token: &CancellationToken, name: &str, profile: &Profile) -> Result<()>;

    /// Creates and starts one worker container; its stdout/stderr flow
    /// into `output`.
    async fn spawn(
        &self,
        token: &CancellationToken,
        config: SpawnConfig,
        output: OutputSender,
    ) -> Result<Arc<dyn ProcessHandle>>;

    /// Engine-reported properties of the container running the given
    /// worker UUID, as a JSON blob; empty when unknown.
    async fn inspect(&self, worker_uuid: &str) -> Result<Vec<u8>>;

    /// Stops background work and releases external handles.
    async fn close(&self);
}

/// Isolation type name → box.
#[derive(Default)]
pub struct BoxRegistry {
    boxes: HashMap<String, Arc<dyn IsolateBox>>,
}

impl BoxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a box under its isolation type name.
    pub fn register(&mut self, isolate_type: impl Into<String>, b: Arc<dyn IsolateBox>) {
        self.boxes.insert(isolate_type.into(), b);
    }

    /// Looks up the box for an isolation type.
    pub fn get(&self, isolate_type: &str) -> Option<Arc<dyn IsolateBox>> {
        self.boxes.get(isolate_type).cloned()
    }

    /// Closes every registered box.
    pub async fn close_all(&self) {
        for b in self.boxes.values() {
            b.close().await;
        }
    }
}
