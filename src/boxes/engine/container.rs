//! Per-container supervisor.
//!
//! A supervisor owns one engine container and the volumes created for
//! it. It is the only mutator of those resources besides the reaper,
//! and cleanup runs at most once no matter how kill and reaping
//! interleave.

use crate::boxes::ProcessHandle;
use crate::constants::KILL_WAIT_TIMEOUT;
use crate::engine::{EngineConn, EngineConnector, EngineError, VolumeDesc, SIGKILL};
use crate::error::Result;
use async_trait::async_trait;
use crate::profile::Profile;
use crate::protocol::{Output, OutputSender};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to create one worker container.
pub(crate) struct ContainerConfig {
    /// Absolute engine container id.
    pub id: String,
    /// Root directory for the container's volumes.
    pub root_dir: PathBuf,
    /// Engine layer ids of the app image, base first.
    pub layers: Vec<String>,
    pub volume_backend: String,
    pub volume_label: String,
    pub cleanup_enabled: bool,
    pub image_uri: Option<String>,
    pub ulimits: String,
    pub resolv_conf: String,
    pub profile: Profile,
    pub executable: String,
    pub args: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

/// Handle to one live engine container.
pub struct Supervisor {
    engine: Arc<dyn EngineConnector>,
    uuid: String,
    container_id: String,
    root_dir: PathBuf,
    root_volume: VolumeDesc,
    extra_volumes: Vec<VolumeDesc>,
    output: OutputSender,
    cleanup_enabled: bool,
    cleaned: AtomicBool,
}

impl Supervisor {
    /// Creates the root volume, the extra volumes and the engine
    /// container. Any failure destroys whatever was already created.
    pub(crate) async fn create(
        engine: Arc<dyn EngineConnector>,
        conn: &dyn EngineConn,
        cfg: ContainerConfig,
        output: OutputSender,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.root_dir).await?;

        let volume_props = HashMap::from([
            ("backend".to_string(), cfg.volume_backend.clone()),
            ("layers".to_string(), cfg.layers.join(";")),
            ("private".to_string(), cfg.volume_label.clone()),
        ]);
        let root_volume = conn
            .create_volume(Some(cfg.root_dir.as_path()), &volume_props)
            .await?;

        let mut extra_volumes = Vec::new();
        for volume in &cfg.profile.volumes {
            let target = cfg.root_dir.join(volume.target.trim_start_matches('/'));
            if let Err(e) = tokio::fs::create_dir_all(&target).await {
                Self::rollback_volumes(conn, &root_volume, &extra_volumes).await;
                return Err(e.into());
            }
            match conn.create_volume(Some(target.as_path()), &volume.properties).await {
                Ok(v) => extra_volumes.push(v),
                Err(e) => {
                    Self::rollback_volumes(conn, &root_volume, &extra_volumes).await;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = Self::create_engine_container(conn, &cfg, &root_volume).await {
            Self::rollback_volumes(conn, &root_volume, &extra_volumes).await;
            return Err(e);
        }

        Ok(Self {
            engine,
            uuid: cfg.args.get("--uuid").cloned().unwrap_or_default(),
            container_id: cfg.id,
            root_dir: cfg.root_dir,
            root_volume,
            extra_volumes,
            output,
            cleanup_enabled: cfg.cleanup_enabled,
            cleaned: AtomicBool::new(false),
        })
    }

    async fn create_engine_container(
        conn: &dyn EngineConn,
        cfg: &ContainerConfig,
        root_volume: &VolumeDesc,
    ) -> Result<()> {
        conn.create_container(&cfg.id).await?;

        let mut command = cfg.executable.clone();
        let mut args: Vec<_> = cfg.args.iter().collect();
        args.sort();
        for (key, value) in args {
            command.push(' ');
            command.push_str(key);
            command.push(' ');
            command.push_str(value);
        }

        let mut env: Vec<_> = cfg.env.iter().collect();
        env.sort();
        let mut env_spec: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if let Some(uri) = &cfg.image_uri {
            env_spec.push(format!("IMG_URI={uri}"));
        }

        conn.set_property(&cfg.id, "root", &root_volume.path.to_string_lossy())
            .await?;
        conn.set_property(&cfg.id, "command", &command).await?;
        conn.set_property(&cfg.id, "env", &env_spec.join(";")).await?;
        if !cfg.ulimits.is_empty() {
            conn.set_property(&cfg.id, "ulimit", &cfg.ulimits).await?;
        }
        if !cfg.resolv_conf.is_empty() {
            conn.set_property(&cfg.id, "resolv_conf", &cfg.resolv_conf)
                .await?;
        }
        Ok(())
    }

    async fn rollback_volumes(
        conn: &dyn EngineConn,
        root_volume: &VolumeDesc,
        extra_volumes: &[VolumeDesc],
    ) {
        for volume in std::iter::once(root_volume).chain(extra_volumes) {
            if let Err(e) = conn.unlink_volume(&volume.path, "***").await {
                warn!(volume = %volume.path.display(), error = %e, "rollback unlink failed");
            }
        }
    }

    /// Engine container id this supervisor owns.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Client-assigned worker UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Starts the container.
    pub(crate) async fn start(&self, conn: &dyn EngineConn) -> Result<()> {
        debug!(id = %self.container_id, "start container");
        conn.start(&self.container_id).await?;
        Ok(())
    }

    /// Kills the container and reclaims its resources.
    ///
    /// The engine's accumulated stdout/stderr are forwarded to the
    /// attached sink first; a container that already reached a terminal
    /// state counts as killed. Cleanup runs regardless of the kill
    /// outcome.
    pub async fn kill(&self) -> Result<()> {
        info!(id = %self.container_id, "kill container");
        let conn = self.engine.connect().await?;

        self.forward_data(conn.as_ref(), "stdout").await;
        self.forward_data(conn.as_ref(), "stderr").await;

        let killed = match conn.kill(&self.container_id, SIGKILL).await {
            Ok(()) => conn
                .wait(
                    std::slice::from_ref(&self.container_id),
                    KILL_WAIT_TIMEOUT,
                )
                .await
                .map(|_| ())
                .map_err(Into::into),
            // Already dead or already gone both count as killed.
            Err(EngineError::InvalidState(_)) | Err(EngineError::ContainerDoesNotExist(_)) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        };

        self.cleanup(conn.as_ref()).await;
        killed
    }

    async fn forward_data(&self, conn: &dyn EngineConn, field: &str) {
        match conn.get_data(&self.container_id, field).await {
            Ok(data) => {
                debug!(id = %self.container_id, field, bytes = data.len(), "forwarding output");
                let _ = self.output.send(Output::Data(data.into_bytes()));
            }
            Err(e) => {
                warn!(id = %self.container_id, field, error = %e, "unable to read output");
            }
        }
    }

    /// Destroys the container's volumes, the container itself and its
    /// root directory. Idempotent and best-effort; skipped entirely
    /// when cleanup is disabled.
    pub(crate) async fn cleanup(&self, conn: &dyn EngineConn) {
        if !self.cleanup_enabled {
            return;
        }
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        for volume in std::iter::once(&self.root_volume).chain(&self.extra_volumes) {
            match conn.unlink_volume(&volume.path, "***").await {
                Ok(()) => debug!(volume = %volume.path.display(), "volume destroyed"),
                Err(e) => {
                    warn!(volume = %volume.path.display(), error = %e, "volume not destroyed")
                }
            }
        }
        if let Err(e) = conn.destroy(&self.container_id).await {
            warn!(id = %self.container_id, error = %e, "container not destroyed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.root_dir).await {
            warn!(dir = %self.root_dir.display(), error = %e, "root dir not removed");
        }
    }
}

#[async_trait]
impl ProcessHandle for Supervisor {
    async fn kill(&self) -> Result<()> {
        Supervisor::kill(self).await
    }
}
