//! Content-addressed blob repository.
//!
//! Registry blobs are downloaded once into a digest-keyed directory and
//! shared by every spool that references them. Concurrent requests for
//! the same digest deduplicate: the first caller fetches, the rest wait
//! on the same completion and observe the same path.
//!
//! A blob file only ever appears after its full content was written to
//! a sibling temp file and atomically renamed over the final path, so a
//! crash mid-download never leaves a partial blob observable.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::File;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Deduplicated, disk-backed blob repository.
pub struct BlobRepository {
    root: PathBuf,
    /// Digest → completion of the single in-flight fetch. Waiters hold
    /// a receiver clone; the fetch signals by dropping the sender.
    inflight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

enum Role {
    Fetch(watch::Sender<()>),
    Wait(watch::Receiver<()>),
}

struct InflightGuard<'a> {
    repo: &'a BlobRepository,
    digest: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self
            .repo
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        inflight.remove(self.digest);
    }
}

impl BlobRepository {
    /// Opens (and creates) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Directory the blobs live in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of a blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(digest.replace(':', "_"))
    }

    /// Returns the local path of the blob, fetching it with `fetch` if
    /// it is not cached yet.
    ///
    /// `fetch` receives the temp file to stream the content into; it is
    /// invoked at most once per call, and at most one fetch per digest
    /// is in flight across all callers. If the active fetch fails, one
    /// of the waiters takes over with its own `fetch`.
    pub async fn get<F, Fut>(&self, digest: &str, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(File) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let path = self.blob_path(digest);
        loop {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }

            let role = {
                let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                // The previous fetch may have completed between the
                // existence check and taking the lock.
                if path.exists() {
                    return Ok(path);
                }
                match inflight.get(digest) {
                    Some(rx) => Role::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        inflight.insert(digest.to_string(), rx);
                        Role::Fetch(tx)
                    }
                }
            };

            match role {
                Role::Wait(mut rx) => {
                    // Wakes when the fetcher drops its sender, success
                    // or not; the loop re-checks the file.
                    let _ = rx.changed().await;
                }
                Role::Fetch(_tx) => {
                    // The guard removes the inflight entry even when
                    // this future is dropped mid-download; `_tx` drops
                    // after it and wakes the waiters.
                    let _guard = InflightGuard { repo: self, digest };
                    let result = self.download(digest, &path, fetch).await;
                    return result.map(|()| path);
                }
            }
        }
    }

    async fn download<F, Fut>(&self, digest: &str, path: &Path, fetch: F) -> Result<()>
    where
        F: FnOnce(File) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let tmp = self.root.join(format!(
            ".{}.tmp.{}",
            digest.replace(':', "_"),
            uuid::Uuid::now_v7()
        ));
        let file = File::create(&tmp).await?;

        match fetch(file).await {
            Ok(()) => {
                tokio::fs::rename(&tmp, path).await?;
                debug!(digest, path = %path.display(), "blob fetched");
                Ok(())
            }
            Err(e) => {
                warn!(digest, error = %e, "blob fetch failed");
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}
