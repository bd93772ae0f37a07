//! Box configuration.

use crate::constants::{
    DEFAULT_APP_VOLUME_LABEL, DEFAULT_DIAL_RETRIES, DEFAULT_SPAWN_CONCURRENCY,
    DEFAULT_VOLUME_BACKEND, DEFAULT_WAIT_LOOP_STEP_SEC,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Configuration of an engine-backed box.
///
/// Field names match the configuration keys the control plane ships;
/// everything except the three paths has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    /// Directory layer blobs are downloaded into.
    pub layers: PathBuf,
    /// Directory container root directories are created under.
    pub containers: PathBuf,
    /// Path of the persistent layer journal.
    pub journal: PathBuf,

    /// Spawn semaphore permits.
    pub concurrency: u32,
    /// Extra registry connection attempts.
    pub dialretries: u32,
    /// Whether killed containers have their volumes and directories
    /// removed.
    pub cleanupenabled: bool,
    /// Whether imported layers are marked weak in the engine.
    pub weakenabled: bool,
    /// Whether the startup GC pass runs.
    pub gc: bool,
    /// Seconds between reaper passes.
    pub waitloopstepsec: u64,
    /// Registry host to credentials (`user:password`).
    pub registryauth: HashMap<String, String>,
    /// Whether spawned containers get the image URI in their
    /// environment.
    pub setimguri: bool,
    /// Engine volume backend for container root volumes.
    pub volumebackend: String,
    /// Ulimits applied to every container, engine syntax.
    pub defaultulimits: String,
    /// resolv.conf content applied to every container.
    #[serde(rename = "defaultresolv_conf")]
    pub default_resolv_conf: String,
    /// `private` label stamped on app volumes.
    pub cocaineappvolumelabel: String,
    /// Download helper executable; empty disables the helper source.
    pub download_helper_cmd: String,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            layers: PathBuf::new(),
            containers: PathBuf::new(),
            journal: PathBuf::new(),
            concurrency: DEFAULT_SPAWN_CONCURRENCY,
            dialretries: DEFAULT_DIAL_RETRIES,
            cleanupenabled: true,
            weakenabled: false,
            gc: true,
            waitloopstepsec: DEFAULT_WAIT_LOOP_STEP_SEC,
            registryauth: HashMap::new(),
            setimguri: false,
            volumebackend: DEFAULT_VOLUME_BACKEND.to_string(),
            defaultulimits: String::new(),
            default_resolv_conf: String::new(),
            cocaineappvolumelabel: DEFAULT_APP_VOLUME_LABEL.to_string(),
            download_helper_cmd: String::new(),
        }
    }
}

impl BoxConfig {
    /// Checks the required fields and normalizes defaults that may have
    /// been emptied by the deserialized input.
    pub fn validate(&mut self) -> Result<()> {
        if self.layers.as_os_str().is_empty() {
            return Err(Error::Config(
                "option layers is invalid or unspecified".into(),
            ));
        }
        if self.containers.as_os_str().is_empty() {
            return Err(Error::Config(
                "option containers is invalid or unspecified".into(),
            ));
        }
        if self.journal.as_os_str().is_empty() {
            return Err(Error::Config(
                "option journal is empty or unspecified".into(),
            ));
        }
        if self.volumebackend.is_empty() {
            self.volumebackend = DEFAULT_VOLUME_BACKEND.to_string();
        }
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_SPAWN_CONCURRENCY;
        }
        if self.waitloopstepsec == 0 {
            self.waitloopstepsec = DEFAULT_WAIT_LOOP_STEP_SEC;
        }
        Ok(())
    }

    /// True when the download helper source is available.
    pub fn helper_enabled(&self) -> bool {
        !self.download_helper_cmd.is_empty()
    }

    /// Root directory for one container.
    pub fn container_root_dir(&self, container_id: &str) -> PathBuf {
        self.containers.join(container_id)
    }

    /// Credentials for a registry host, if configured.
    pub fn registry_credentials(&self, registry: &str) -> Option<(&str, &str)> {
        self.registryauth
            .get(registry)
            .and_then(|v| v.split_once(':'))
    }

    /// Directory the journal lives in, for sibling temp files.
    pub fn journal_dir(&self) -> &Path {
        self.journal.parent().unwrap_or_else(|| Path::new("."))
    }
}
