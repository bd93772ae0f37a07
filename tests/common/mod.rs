//! Shared test doubles: an in-memory container engine, a recording
//! network allocator and a scriptable isolation box.

#![allow(dead_code)]

use async_trait::async_trait;
use isobox::boxes::{IsolateBox, ProcessHandle};
use isobox::engine::{
    EngineConn, EngineConnector, EngineError, EngineResult, VolumeDesc,
};
use isobox::error::{Error, Result};
use isobox::netalloc::{Allocation, NetAllocator};
use isobox::profile::{Profile, SpawnConfig};
use isobox::protocol::{Output, OutputSender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Mock Engine
// =============================================================================

#[derive(Default)]
pub struct ContainerRecord {
    pub state: String,
    pub properties: HashMap<String, String>,
    pub data: HashMap<String, String>,
}

#[derive(Default)]
pub struct EngineState {
    pub layers: Vec<String>,
    pub containers: HashMap<String, ContainerRecord>,
    pub volumes: Vec<VolumeDesc>,
    /// `(path, container)` pairs passed to unlink_volume.
    pub unlinked: Vec<(PathBuf, String)>,
    /// Ids passed to destroy, in order.
    pub destroyed: Vec<String>,
    /// Ids passed to create_container, in order.
    pub created: Vec<String>,
    pub fail_create_container: bool,
}

/// Shared-state mock of the container engine; every connection sees the
/// same state, like connections to one system service would.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
    /// When set, `start` blocks on a permit; lets tests hold spawns
    /// inside the critical section.
    start_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            start_gate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_layers(layers: &[&str]) -> Self {
        let engine = Self::new();
        engine.state.lock().unwrap().layers = layers.iter().map(|s| s.to_string()).collect();
        engine
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn gate_starts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.start_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn unlink_count(&self, path: &Path) -> usize {
        self.state()
            .unlinked
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }
}

pub struct MockConn {
    state: Arc<Mutex<EngineState>>,
    start_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

#[async_trait]
impl EngineConnector for MockEngine {
    async fn connect(&self) -> EngineResult<Box<dyn EngineConn>> {
        Ok(Box::new(MockConn {
            state: Arc::clone(&self.state),
            start_gate: Arc::clone(&self.start_gate),
        }))
    }
}

#[async_trait]
impl EngineConn for MockConn {
    async fn root_namespace(&self) -> EngineResult<String> {
        Ok("/".to_string())
    }

    async fn import_layer(&self, id: &str, _tarball: &Path) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.layers.iter().any(|l| l == id) {
            return Err(EngineError::LayerAlreadyExists(id.to_string()));
        }
        state.layers.push(id.to_string());
        Ok(())
    }

    async fn list_layers(&self) -> EngineResult<Vec<String>> {
        Ok(self.state.lock().unwrap().layers.clone())
    }

    async fn list_containers(&self) -> EngineResult<Vec<String>> {
        Ok(self.state.lock().unwrap().containers.keys().cloned().collect())
    }

    async fn create_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create_container {
            return Err(EngineError::Other {
                name: "ResourceNotAvailable".to_string(),
                message: "injected create failure".to_string(),
            });
        }
        state.created.push(id.to_string());
        state.containers.insert(
            id.to_string(),
            ContainerRecord {
                state: "stopped".to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn set_property(&self, id: &str, property: &str, value: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        record.properties.insert(property.to_string(), value.to_string());
        Ok(())
    }

    async fn get_property(&self, id: &str, property: &str) -> EngineResult<String> {
        let state = self.state.lock().unwrap();
        let record = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        if property == "state" {
            return Ok(record.state.clone());
        }
        Ok(record.properties.get(property).cloned().unwrap_or_default())
    }

    async fn get_data(&self, id: &str, field: &str) -> EngineResult<String> {
        let state = self.state.lock().unwrap();
        let record = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        Ok(record.data.get(field).cloned().unwrap_or_default())
    }

    async fn get_properties(
        &self,
        id: &str,
        properties: &[&str],
    ) -> EngineResult<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        let record = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        let mut out = HashMap::new();
        for property in properties {
            let value = if *property == "state" {
                record.state.clone()
            } else {
                record.properties.get(*property).cloned().unwrap_or_default()
            };
            out.insert(property.to_string(), value);
        }
        Ok(out)
    }

    async fn start(&self, id: &str) -> EngineResult<()> {
        let gate = self.start_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| EngineError::Transport(
                "gate closed".to_string(),
            ))?;
        }
        let mut state = self.state.lock().unwrap();
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        record.state = "running".to_string();
        Ok(())
    }

    async fn kill(&self, id: &str, _signal: i32) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::ContainerDoesNotExist(id.to_string()))?;
        if record.state == "dead" {
            return Err(EngineError::InvalidState(format!("{id} is already dead")));
        }
        record.state = "dead".to_string();
        Ok(())
    }

    async fn wait(&self, ids: &[String], _timeout: Duration) -> EngineResult<String> {
        Ok(ids.first().cloned().unwrap_or_default())
    }

    async fn destroy(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(id).is_none() {
            return Err(EngineError::ContainerDoesNotExist(id.to_string()));
        }
        state.destroyed.push(id.to_string());
        Ok(())
    }

    async fn create_volume(
        &self,
        path: Option<&Path>,
        properties: &HashMap<String, String>,
    ) -> EngineResult<VolumeDesc> {
        let volume = VolumeDesc {
            path: path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/anon")),
            properties: properties.clone(),
        };
        self.state.lock().unwrap().volumes.push(volume.clone());
        Ok(volume)
    }

    async fn unlink_volume(&self, path: &Path, container: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.unlinked.push((path.to_path_buf(), container.to_string()));
        state.volumes.retain(|v| v.path != path);
        Ok(())
    }

    async fn list_volumes(&self) -> EngineResult<Vec<VolumeDesc>> {
        Ok(self.state.lock().unwrap().volumes.clone())
    }
}

// =============================================================================
// Mock Allocator
// =============================================================================

#[derive(Default)]
pub struct AllocatorState {
    pub bound: Vec<String>,
    pub used: Vec<Allocation>,
    /// `(net_id, id, reason)` triples passed to unuse_alloc.
    pub unused: Vec<(String, String, String)>,
}

#[derive(Clone, Default)]
pub struct MockAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_used(used: Vec<Allocation>) -> Self {
        let allocator = Self::default();
        allocator.state.lock().unwrap().used = used;
        allocator
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl NetAllocator for MockAllocator {
    async fn bind_allocs(&self, _token: &CancellationToken, net_id: &str) -> Result<()> {
        self.state.lock().unwrap().bound.push(net_id.to_string());
        Ok(())
    }

    async fn used_allocations(
        &self,
        _token: &CancellationToken,
    ) -> Result<(Vec<Allocation>, String)> {
        let state = self.state.lock().unwrap();
        Ok((state.used.clone(), format!("used={}", state.used.len())))
    }

    async fn unuse_alloc(
        &self,
        _token: &CancellationToken,
        net_id: &str,
        id: &str,
        reason: &str,
    ) -> Result<()> {
        self.state.lock().unwrap().unused.push((
            net_id.to_string(),
            id.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }
}

// =============================================================================
// Mock Box
// =============================================================================

/// Scriptable box for dispatcher tests.
#[derive(Default)]
pub struct MockBox {
    /// Spool blocks until the token cancels, then reports cancellation.
    pub block_spool: bool,
    /// Spool fails with this message.
    pub spool_error: Option<String>,
    /// Spawn fails with this message.
    pub spawn_error: Option<String>,
    /// Chunks the spawned worker writes before exiting.
    pub output_chunks: Vec<Vec<u8>>,
    /// Keeps the output stream open until the worker is killed.
    pub hold_output: bool,
    pub kills: Arc<AtomicUsize>,
}

pub struct MockProcess {
    kills: Arc<AtomicUsize>,
    _output: Option<OutputSender>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    async fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl IsolateBox for MockBox {
    async fn spool(&self, token: &CancellationToken, _name: &str, _profile: &Profile) -> Result<()> {
        if self.block_spool {
            token.cancelled().await;
            return Err(Error::Canceled);
        }
        if let Some(message) = &self.spool_error {
            return Err(Error::Helper(message.clone()));
        }
        Ok(())
    }

    async fn spawn(
        &self,
        _token: &CancellationToken,
        _config: SpawnConfig,
        output: OutputSender,
    ) -> Result<Arc<dyn ProcessHandle>> {
        if let Some(message) = &self.spawn_error {
            return Err(Error::Helper(message.clone()));
        }
        for chunk in &self.output_chunks {
            let _ = output.send(Output::Data(chunk.clone()));
        }
        Ok(Arc::new(MockProcess {
            kills: Arc::clone(&self.kills),
            _output: self.hold_output.then_some(output),
        }))
    }

    async fn inspect(&self, _worker_uuid: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn close(&self) {}
}
