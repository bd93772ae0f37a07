//! # isobox
//!
//! **Isolation daemon worker**
//!
//! Launches and supervises sandboxed application processes on behalf of
//! a control plane. Upstream clients drive framed sessions to spool an
//! application image (materialize its root filesystem as a stack of
//! engine-imported layers) and to spawn and kill worker containers
//! built from that image, with stdout/stderr streamed back on the same
//! session.
//!
//! # Architecture Overview
//!
//! ```text
//! session ──► Dispatch state machine ──► BoxRegistry ──► EngineBox
//!                  │                                        │
//!                  │  SPOOL ──────────► spool ──► HelperSource / RegistrySource
//!                  │                                        │            │
//!                  │  SPAWN ──────────► spawn               │      BlobRepository
//!                  │                      │                 ▼            │
//!                  ◄── output stream ── Supervisor ◄─── container engine ◄┘
//!                                         ▲
//!                              reaper loop + journal dumper
//! ```
//!
//! The container engine (layer import, volumes, container lifecycle)
//! and the network-allocation service are external collaborators
//! behind the [`engine::EngineConnector`] and [`netalloc::NetAllocator`]
//! traits; the transport that frames session messages is supplied by
//! the embedding daemon, which feeds [`dispatch::run_session`].
//!
//! # Example
//!
//! ```rust,ignore
//! use isobox::{BoxConfig, BoxRegistry, EngineBox, run_session};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(engine: Arc<dyn isobox::engine::EngineConnector>,
//! #                  net: Arc<dyn isobox::netalloc::NetAllocator>) -> isobox::Result<()> {
//! let root = CancellationToken::new();
//! let config: BoxConfig = serde_json::from_str(r#"{
//!     "layers": "/var/spool/isobox/layers",
//!     "containers": "/var/spool/isobox/containers",
//!     "journal": "/var/spool/isobox/journal"
//! }"#)?;
//!
//! let mut boxes = BoxRegistry::new();
//! boxes.register(
//!     "porto",
//!     EngineBox::new(&root, "porto", config, engine, net).await?,
//! );
//! let boxes = Arc::new(boxes);
//!
//! // For every accepted session:
//! let (msg_tx, msg_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
//! tokio::spawn(run_session(boxes.clone(), msg_rx, reply_tx, root.child_token()));
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod boxes;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod journal;
pub mod netalloc;
pub mod profile;
pub mod protocol;
pub mod source;

pub use crate::blob::BlobRepository;
pub use crate::boxes::{BoxRegistry, EngineBox, IsolateBox, ProcessHandle};
pub use crate::config::BoxConfig;
pub use crate::dispatch::{run_session, Dispatch};
pub use crate::error::{Error, Result};
pub use crate::journal::Journal;
pub use crate::profile::{Profile, SpawnConfig};
pub use crate::protocol::{Message, Output, OutputSender, Reply};
