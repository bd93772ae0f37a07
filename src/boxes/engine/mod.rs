//! Engine-backed isolation box.
//!
//! The box owns the containers map, the spawn admission machinery, the
//! layer journal and the blob repository, and runs the reaper and the
//! periodic journal dumper as background tasks.

mod container;
mod reaper;

pub use self::container::Supervisor;

use crate::blob::BlobRepository;
use crate::boxes::{IsolateBox, ProcessHandle};
use crate::config::BoxConfig;
use crate::constants::{INSPECT_PROPERTIES, JOURNAL_DUMP_INTERVAL, SPAWN_QUEUE_LIMIT, START_MARKER};
use crate::engine::EngineConnector;
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::netalloc::NetAllocator;
use crate::profile::{sanitize_app_name, Profile, SpawnConfig};
use crate::protocol::{Output, OutputSender};
use crate::source::{HelperSource, RegistrySource};
use self::container::ContainerConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Isolation box running workers as engine containers.
pub struct EngineBox {
    pub(crate) name: String,
    pub(crate) config: BoxConfig,
    pub(crate) engine: Arc<dyn EngineConnector>,
    pub(crate) net: Arc<dyn NetAllocator>,
    pub(crate) token: CancellationToken,

    journal: Arc<Mutex<Journal>>,
    registry: RegistrySource,
    helper: Option<HelperSource>,

    pub(crate) containers: Mutex<HashMap<String, Arc<Supervisor>>>,
    spawn_sem: Arc<Semaphore>,
    spawn_queue: AtomicI64,
    root_prefix: String,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineBox {
    /// Builds the box: validates configuration, probes the engine,
    /// loads and reconciles the journal, and launches the reaper and
    /// journal-dumper tasks.
    pub async fn new(
        parent: &CancellationToken,
        name: impl Into<String>,
        mut config: BoxConfig,
        engine: Arc<dyn EngineConnector>,
        net: Arc<dyn NetAllocator>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        config.validate()?;

        info!(dir = %config.layers.display(), "create directory for layers");
        tokio::fs::create_dir_all(&config.layers).await?;
        info!(dir = %config.containers.display(), "create directory for containers");
        tokio::fs::create_dir_all(&config.containers).await?;
        tokio::fs::create_dir_all(config.journal_dir()).await?;

        let blobs = Arc::new(BlobRepository::open(&config.layers)?);

        let conn = engine.connect().await?;
        let mut root_prefix = conn.root_namespace().await?;
        if root_prefix == "/" {
            root_prefix.clear();
        }

        let mut journal = Journal::new();
        match std::fs::File::open(&config.journal) {
            Ok(file) => journal.load(file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %config.journal.display(), "journal file not found, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        let known = conn.list_layers().await?.into_iter().collect();
        journal.retain_known_layers(&known);
        debug!(journal = %journal, "journal reconciled against engine layers");

        let helper = config
            .helper_enabled()
            .then(|| HelperSource::new(config.download_helper_cmd.clone(), config.layers.clone()));
        let registry = RegistrySource::new(blobs, &config);

        let bx = Arc::new(Self {
            name,
            spawn_sem: Arc::new(Semaphore::new(config.concurrency as usize)),
            spawn_queue: AtomicI64::new(0),
            journal: Arc::new(Mutex::new(journal)),
            containers: Mutex::new(HashMap::new()),
            token: parent.child_token(),
            root_prefix,
            registry,
            helper,
            engine,
            net,
            config,
            tasks: Mutex::new(Vec::new()),
        });

        let handles = vec![
            tokio::spawn(reaper::run(Arc::clone(&bx))),
            tokio::spawn(Self::dump_journal_loop(Arc::clone(&bx))),
        ];
        *bx.tasks.lock().unwrap_or_else(|e| e.into_inner()) = handles;

        Ok(bx)
    }

    // =========================================================================
    // Journal
    // =========================================================================

    pub(crate) fn journal_layers(&self, app: &str) -> Option<Vec<String>> {
        let journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        journal.layers_for(app).map(<[String]>::to_vec)
    }

    fn journal_insert(&self, app: &str, layers: Vec<String>) {
        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        journal.insert_layers(app, layers);
        debug!(journal = %journal, "journal updated");
    }

    /// Serializes the journal and atomically replaces the journal file.
    async fn dump_journal(&self) -> Result<()> {
        let mut buf = Vec::new();
        {
            let journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
            journal.dump(&mut buf)?;
        }
        let tmp = self
            .config
            .journal_dir()
            .join(format!(".journal.tmp.{}", uuid::Uuid::now_v7()));
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.config.journal).await?;
        Ok(())
    }

    async fn dump_journal_loop(bx: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(JOURNAL_DUMP_INTERVAL) => {
                    if let Err(e) = bx.dump_journal().await {
                        warn!(error = %e, "periodic journal dump failed");
                    }
                }
                _ = bx.token.cancelled() => {
                    if let Err(e) = bx.dump_journal().await {
                        warn!(error = %e, "final journal dump failed");
                    }
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Containers Map
    // =========================================================================

    pub(crate) fn tracked_ids(&self) -> Vec<String> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.keys().cloned().collect()
    }

    /// Removes a container from tracking; idempotent.
    pub(crate) fn take_container(&self, id: &str) -> Option<Arc<Supervisor>> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let taken = containers.remove(id);
        if taken.is_some() {
            debug!(id, rest = containers.len(), "container untracked");
        }
        taken
    }

    fn insert_container(&self, id: String, supervisor: Arc<Supervisor>) {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.insert(id, supervisor);
    }

    fn absolute_id(&self, container_id: &str) -> String {
        if self.root_prefix.is_empty() {
            container_id.to_string()
        } else {
            format!("{}/{}", self.root_prefix, container_id)
        }
    }
}

#[async_trait]
impl IsolateBox for EngineBox {
    async fn spool(&self, token: &CancellationToken, name: &str, profile: &Profile) -> Result<()> {
        info!(app = name, "spool");
        let conn = self.engine.connect().await?;

        let mut imported = None;
        if !profile.extended_info.layers.is_empty() {
            if let Some(helper) = &self.helper {
                debug!(app = name, "trying declared layers via download helper");
                match helper.fetch_layers(token, conn.as_ref(), name, profile).await {
                    Ok(layers) => imported = Some(layers),
                    Err(e) => {
                        warn!(app = name, error = %e, "download helper failed, falling back to registry");
                    }
                }
            }
        }
        let layers = match imported {
            Some(layers) => layers,
            None => {
                self.registry
                    .fetch_layers(token, conn.as_ref(), name, profile)
                    .await?
            }
        };
        self.journal_insert(name, layers);

        if profile.wants_net_allocation() {
            let net_id = profile.net_id();
            self.net
                .bind_allocs(token, net_id)
                .await
                .map_err(|e| Error::NetBinding {
                    net_id: net_id.to_string(),
                    reason: e.to_string(),
                })?;
            debug!(app = name, net_id, "network allocation bound");
        }
        Ok(())
    }

    async fn spawn(
        &self,
        token: &CancellationToken,
        config: SpawnConfig,
        output: OutputSender,
    ) -> Result<Arc<dyn ProcessHandle>> {
        let profile = Profile::from_value(&config.profile)?;

        // Admission: hard queue cap first, then the concurrency
        // semaphore. The queue gauge is decremented exactly once, on
        // either rejection or acquisition.
        let pending = self.spawn_queue.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > SPAWN_QUEUE_LIMIT {
            self.spawn_queue.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::TryAgainLater);
        }
        let permit = tokio::select! {
            _ = token.cancelled() => {
                self.spawn_queue.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::SpawnCanceled);
            }
            permit = Arc::clone(&self.spawn_sem).acquire_owned() => permit,
        };
        self.spawn_queue.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit.map_err(|_| Error::SpawnCanceled)?;

        let layers = self
            .journal_layers(&config.name)
            .filter(|layers| !layers.is_empty())
            .ok_or(Error::NoJournalLayers)?;

        let container_id = format!(
            "{}_{}",
            sanitize_app_name(&config.name),
            config.worker_uuid()
        );
        let absolute_id = self.absolute_id(&container_id);
        info!(
            app = %config.name,
            id = %absolute_id,
            layers = layers.len(),
            "create container"
        );

        let conn = self.engine.connect().await?;
        let cfg = ContainerConfig {
            id: absolute_id.clone(),
            root_dir: self.config.container_root_dir(&container_id),
            layers,
            volume_backend: self.config.volumebackend.clone(),
            volume_label: self.config.cocaineappvolumelabel.clone(),
            cleanup_enabled: self.config.cleanupenabled,
            image_uri: self
                .config
                .setimguri
                .then(|| profile.image_uri(&config.name)),
            ulimits: self.config.defaultulimits.clone(),
            resolv_conf: self.config.default_resolv_conf.clone(),
            profile,
            executable: config.executable.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        };

        let supervisor = Arc::new(
            Supervisor::create(Arc::clone(&self.engine), conn.as_ref(), cfg, output.clone())
                .await?,
        );
        self.insert_container(absolute_id.clone(), Arc::clone(&supervisor));

        if let Err(e) = supervisor.start(conn.as_ref()).await {
            supervisor.cleanup(conn.as_ref()).await;
            self.take_container(&absolute_id);
            return Err(e);
        }
        let _ = output.send(Output::Data(START_MARKER.to_vec()));

        Ok(supervisor)
    }

    async fn inspect(&self, worker_uuid: &str) -> Result<Vec<u8>> {
        let found = {
            let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            containers
                .values()
                .find(|s| s.uuid() == worker_uuid)
                .map(|s| s.container_id().to_string())
        };
        match found {
            Some(id) => {
                let conn = self.engine.connect().await?;
                let properties = conn.get_properties(&id, INSPECT_PROPERTIES).await?;
                Ok(serde_json::to_vec(&properties)?)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn close(&self) {
        self.token.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.net.close().await;
        info!(name = %self.name, "box closed");
    }
}
