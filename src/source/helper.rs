//! Download-helper image source.
//!
//! Some images ship a declared layer list that a content-addressed
//! helper command can fetch faster than the registry. Each layer is
//! fetched by invoking the helper, verified against its declared
//! SHA-256, and imported into the engine.

use crate::constants::{
    HELPER_BASE_TIMEOUT_SECS, HELPER_CHUNK_BYTES, HELPER_LAYER_TIMEOUT, HELPER_SECS_PER_CHUNK,
};
use crate::engine::{EngineConn, EngineError};
use crate::error::{Error, Result};
use crate::profile::{LayerDecl, Profile};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fetches declared layers through an external helper command.
pub struct HelperSource {
    command: String,
    layers_dir: PathBuf,
}

impl HelperSource {
    pub fn new(command: impl Into<String>, layers_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            layers_dir: layers_dir.into(),
        }
    }

    /// Fetches, verifies and imports every declared layer; returns the
    /// engine layer ids in declaration order.
    pub async fn fetch_layers(
        &self,
        token: &CancellationToken,
        engine: &dyn EngineConn,
        name: &str,
        profile: &Profile,
    ) -> Result<Vec<String>> {
        let mut layers = Vec::new();
        for layer in &profile.extended_info.layers {
            let layer_id = format!("{}_{}", layer.digest_type, layer.digest);
            self.fetch_one(token, name, layer).await?;

            let blob_path = self.layers_dir.join(&layer.digest);
            verify_sha256(&blob_path, &layer.digest).await?;

            debug!(layer = %layer_id, blob = %blob_path.display(), "importing layer");
            match engine.import_layer(&layer_id, &blob_path).await {
                Ok(()) | Err(EngineError::LayerAlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            layers.push(layer_id);
        }
        Ok(layers)
    }

    async fn fetch_one(
        &self,
        token: &CancellationToken,
        name: &str,
        layer: &LayerDecl,
    ) -> Result<()> {
        let timeout_secs =
            HELPER_BASE_TIMEOUT_SECS + HELPER_SECS_PER_CHUNK * layer.size.div_ceil(HELPER_CHUNK_BYTES);

        let mut command = tokio::process::Command::new(&self.command);
        command
            .arg("get")
            .arg("-d")
            .arg(&self.layers_dir)
            .arg("-t")
            .arg(timeout_secs.to_string())
            .arg(&layer.torrent_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(app = name, torrent = %layer.torrent_id, timeout_secs, "invoking download helper");
        let run = async {
            tokio::time::timeout(HELPER_LAYER_TIMEOUT, command.output())
                .await
                .map_err(|_| Error::Helper(format!("timed out fetching {}", layer.torrent_id)))?
                .map_err(Error::Io)
        };
        let output = tokio::select! {
            _ = token.cancelled() => return Err(Error::Canceled),
            r = run => r?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(app = name, torrent = %layer.torrent_id, %stderr, "download helper failed");
            return Err(Error::Helper(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Streams the file through SHA-256 and compares against the declared
/// hex digest.
async fn verify_sha256(path: &std::path::Path, expected: &str) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let computed = hex::encode(hasher.finalize());
    if computed != expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}
