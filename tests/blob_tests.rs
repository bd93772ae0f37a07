//! Tests for the blob repository: deduplication, shared completion and
//! atomic visibility.

use isobox::error::Error;
use isobox::BlobRepository;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const DIGEST: &str = "sha256:abcd1234";

#[tokio::test]
async fn concurrent_gets_fetch_once() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(BlobRepository::open(dir.path()).unwrap());
    let fetches = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let fetches = Arc::clone(&fetches);
            tokio::spawn(async move {
                repo.get(DIGEST, |mut file| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    file.write_all(b"layer bytes").await?;
                    file.flush().await?;
                    Ok(())
                })
                .await
            })
        })
        .collect();

    let mut paths = Vec::new();
    for task in tasks {
        paths.push(task.await.unwrap().unwrap());
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 1, "exactly one network fetch");
    assert!(paths.windows(2).all(|w| w[0] == w[1]), "all callers share the path");
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"layer bytes");
}

#[tokio::test]
async fn cached_blob_short_circuits() {
    let dir = TempDir::new().unwrap();
    let repo = BlobRepository::open(dir.path()).unwrap();
    std::fs::write(repo.blob_path(DIGEST), b"already here").unwrap();

    let fetches = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&fetches);
    let path = repo
        .get(DIGEST, |_file| async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 0, "cached blob must not refetch");
    assert_eq!(std::fs::read(path).unwrap(), b"already here");
}

#[tokio::test]
async fn failed_fetch_surfaces_error_and_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let repo = BlobRepository::open(dir.path()).unwrap();

    let result = repo
        .get(DIGEST, |mut file| async move {
            // Partial write, then the download dies.
            file.write_all(b"parti").await?;
            Err(Error::Helper("connection reset".into()))
        })
        .await;

    assert!(result.is_err());
    assert!(!repo.blob_path(DIGEST).exists(), "no partial blob visible");
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "temp file must be removed: {leftovers:?}");

    // A later get is free to fetch again.
    let path = repo
        .get(DIGEST, |mut file| async move {
            file.write_all(b"full content").await?;
            file.flush().await?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"full content");
}

#[tokio::test]
async fn waiter_takes_over_after_failed_fetch() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(BlobRepository::open(dir.path()).unwrap());
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();

    let failing = {
        let repo = Arc::clone(&repo);
        tokio::spawn(async move {
            repo.get(DIGEST, |_file| async move {
                started_tx.send(()).ok();
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(Error::Helper("flaky mirror".into()))
            })
            .await
        })
    };

    // Joins as a waiter while the failing fetch is in flight, then
    // takes over and succeeds.
    started_rx.await.unwrap();
    let path = repo
        .get(DIGEST, |mut file| async move {
            file.write_all(b"good copy").await?;
            file.flush().await?;
            Ok(())
        })
        .await
        .unwrap();

    assert!(failing.await.unwrap().is_err(), "first caller sees its own failure");
    assert_eq!(std::fs::read(path).unwrap(), b"good copy");
}
