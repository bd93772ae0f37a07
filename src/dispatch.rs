//! Per-session dispatch state machine.
//!
//! Every client session is driven by one dispatcher. The dispatcher is
//! a tagged variant: the initial state accepts spool and spawn
//! requests, and each transitions into a state that accepts exactly
//! the follow-up the protocol allows (cancel, kill). Handling a
//! message yields the successor state; an unrecognized opcode
//! terminates the session.

use crate::boxes::{BoxRegistry, ProcessHandle};
use crate::error::{Error, Result};
use crate::profile::{Profile, SpawnConfig};
use crate::protocol::{
    Message, Output, Reply, ReplySender, OP_SPAWN, OP_SPAWN_KILL, OP_SPOOL, OP_SPOOL_CANCEL,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives request messages from the session transport.
pub type MessageReceiver = mpsc::UnboundedReceiver<Message>;

/// Dispatch state of one session.
pub enum Dispatch {
    Initial(InitialDispatch),
    SpoolCancelable(SpoolCancelDispatch),
    SpawnStreaming(SpawnDispatch),
}

impl Dispatch {
    /// Fresh session state.
    pub fn initial(boxes: Arc<BoxRegistry>, replies: ReplySender, token: CancellationToken) -> Self {
        Dispatch::Initial(InitialDispatch {
            boxes,
            replies,
            token,
        })
    }

    /// Handles one message, returning the successor state; `None` ends
    /// the session.
    pub async fn handle(self, msg: Message) -> Result<Option<Dispatch>> {
        match self {
            Dispatch::Initial(d) => d.handle(msg),
            Dispatch::SpoolCancelable(d) => d.handle(msg),
            Dispatch::SpawnStreaming(d) => d.handle(msg),
        }
    }
}

/// Runs one session to completion: feeds incoming messages to the
/// dispatch state machine until the channel drains, the session context
/// is canceled, a state declares itself terminal, or a message is
/// rejected.
pub async fn run_session(
    boxes: Arc<BoxRegistry>,
    mut messages: MessageReceiver,
    replies: ReplySender,
    token: CancellationToken,
) -> Result<()> {
    let mut state = Dispatch::initial(boxes, replies, token.clone());
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = messages.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
        };
        match state.handle(msg).await {
            Ok(Some(next)) => state = next,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "session terminated");
                return Err(e);
            }
        }
    }
}

fn unpack<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::InvalidArgs(format!("missing argument {index}")))?;
    serde_json::from_value(value.clone()).map_err(|e| Error::InvalidArgs(e.to_string()))
}

// =============================================================================
// Initial
// =============================================================================

/// State of a session that has not issued a request yet.
pub struct InitialDispatch {
    boxes: Arc<BoxRegistry>,
    replies: ReplySender,
    token: CancellationToken,
}

impl InitialDispatch {
    fn handle(self, msg: Message) -> Result<Option<Dispatch>> {
        match msg.opcode {
            OP_SPOOL => self.on_spool(msg.args),
            OP_SPAWN => self.on_spawn(msg.args),
            other => Err(Error::UnknownTransition(other)),
        }
    }

    /// Resolves the backend and starts the spool on a background task
    /// under a cancelable child context. Exactly one reply is emitted
    /// when the task finishes, unless the spool was canceled.
    fn on_spool(self, args: Vec<Value>) -> Result<Option<Dispatch>> {
        let (profile, name) = match self.unpack_spool(&args) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                let _ = self.replies.send(Reply::spool_error(e.to_string()));
                return Err(e);
            }
        };
        info!(app = %name, isolate_type = %profile.isolate_type, "spool requested");

        let bx = match self.resolve_box(&profile) {
            Ok(bx) => bx,
            Err(e) => {
                let _ = self.replies.send(Reply::spool_error(e.to_string()));
                return Err(e);
            }
        };

        let spool_token = self.token.child_token();
        let task_token = spool_token.clone();
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let result = bx.spool(&task_token, &name, &profile).await;
            if task_token.is_cancelled() {
                debug!(app = %name, "spool canceled, suppressing reply");
                return;
            }
            match result {
                Ok(()) => {
                    let _ = replies.send(Reply::SpoolOk);
                }
                Err(e) => {
                    let _ = replies.send(Reply::spool_error(e.to_string()));
                }
            }
        });

        Ok(Some(Dispatch::SpoolCancelable(SpoolCancelDispatch {
            cancel: spool_token,
        })))
    }

    fn unpack_spool(&self, args: &[Value]) -> Result<(Profile, String)> {
        let raw: Value = unpack(args, 0)?;
        let name: String = unpack(args, 1)?;
        let profile = Profile::from_value(&raw)?;
        if profile.isolate_type.is_empty() {
            return Err(Error::MissingProfileType);
        }
        Ok((profile, name))
    }

    /// Resolves the backend and starts spawn plus output pump on a
    /// background task. The process handle is delivered to the kill
    /// path through a oneshot once the spawn lands.
    fn on_spawn(self, args: Vec<Value>) -> Result<Option<Dispatch>> {
        let raw: Value = unpack(&args, 0)?;
        let name: String = unpack(&args, 1)?;
        let executable: String = unpack(&args, 2)?;
        let spawn_args: HashMap<String, String> = unpack(&args, 3)?;
        let env: HashMap<String, String> = unpack(&args, 4)?;

        let profile = Profile::from_value(&raw)?;
        if profile.isolate_type.is_empty() {
            return Err(Error::MissingProfileType);
        }
        let bx = self.resolve_box(&profile)?;
        info!(app = %name, executable = %executable, "spawn requested");

        let config = SpawnConfig {
            profile: raw,
            name,
            executable,
            args: spawn_args,
            env,
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (proc_tx, proc_rx) = oneshot::channel();
        let replies = self.replies.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let handle = match bx.spawn(&token, config, out_tx).await {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = replies.send(Reply::spawn_error(e.to_string()));
                    return;
                }
            };
            let _ = proc_tx.send(handle);

            // Output pump: forward chunks in stream order until the
            // sink closes; session cancellation stops the pump without
            // killing the container.
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    chunk = out_rx.recv() => match chunk {
                        Some(Output::Data(data)) => {
                            let _ = replies.send(Reply::SpawnWrite { data });
                        }
                        Some(Output::Error(message)) => {
                            let _ = replies.send(Reply::spawn_error(message));
                        }
                        None => {
                            let _ = replies.send(Reply::SpawnClose);
                            return;
                        }
                    },
                }
            }
        });

        Ok(Some(Dispatch::SpawnStreaming(SpawnDispatch {
            replies: self.replies,
            token: self.token,
            killed: Arc::new(AtomicBool::new(false)),
            process: Arc::new(Mutex::new(Some(proc_rx))),
        })))
    }

    fn resolve_box(&self, profile: &Profile) -> Result<Arc<dyn crate::boxes::IsolateBox>> {
        self.boxes
            .get(&profile.isolate_type)
            .ok_or_else(|| Error::UnknownIsolateType(profile.isolate_type.clone()))
    }
}

// =============================================================================
// SpoolCancelable
// =============================================================================

/// State of a session with a spool in flight.
pub struct SpoolCancelDispatch {
    cancel: CancellationToken,
}

impl SpoolCancelDispatch {
    fn handle(self, msg: Message) -> Result<Option<Dispatch>> {
        match msg.opcode {
            OP_SPOOL_CANCEL => {
                debug!("spool cancel requested");
                self.cancel.cancel();
                Ok(None)
            }
            other => Err(Error::UnknownTransition(other)),
        }
    }
}

// =============================================================================
// SpawnStreaming
// =============================================================================

/// State of a session streaming a spawned worker's output.
pub struct SpawnDispatch {
    replies: ReplySender,
    token: CancellationToken,
    /// Set once the kill ran; kills happen at most once no matter how
    /// many kill requests race.
    killed: Arc<AtomicBool>,
    process: Arc<Mutex<Option<oneshot::Receiver<Arc<dyn ProcessHandle>>>>>,
}

impl SpawnDispatch {
    fn handle(self, msg: Message) -> Result<Option<Dispatch>> {
        match msg.opcode {
            OP_SPAWN_KILL => {
                let replies = self.replies.clone();
                let token = self.token.clone();
                let killed = Arc::clone(&self.killed);
                let process = Arc::clone(&self.process);
                tokio::spawn(async move {
                    let receiver = { process.lock().await.take() };
                    let Some(receiver) = receiver else { return };
                    let handle = tokio::select! {
                        _ = token.cancelled() => return,
                        handle = receiver => match handle {
                            Ok(handle) => handle,
                            // The spawn never landed; nothing to kill.
                            Err(_) => return,
                        },
                    };
                    if killed.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    match handle.kill().await {
                        Ok(()) => {
                            let _ = replies.send(Reply::KillOk);
                        }
                        Err(e) => {
                            let _ = replies.send(Reply::KillError {
                                message: e.to_string(),
                            });
                        }
                    }
                });
                // Stay in place: the protocol allows further messages
                // which the consumed oneshot renders harmless.
                Ok(Some(Dispatch::SpawnStreaming(self)))
            }
            other => Err(Error::UnknownTransition(other)),
        }
    }
}
