//! Framed session protocol.
//!
//! Each client session is a duplex channel of framed messages
//! `{opcode, args}`. The transport that parses and writes the frames is
//! external; this module defines the typed messages the dispatcher
//! consumes and the replies it emits.
//!
//! # Opcode Table
//!
//! | State           | Request op        | Replies                                    |
//! |-----------------|-------------------|--------------------------------------------|
//! | Initial         | 0 `SPOOL`         | 0 `SPOOL_OK` / 1 `SPOOL_ERROR(42,42,msg)`  |
//! | Initial         | 1 `SPAWN`         | 0 `SPAWN_WRITE` / 1 `SPAWN_ERROR(42,42,msg)` / 2 `SPAWN_CLOSE` |
//! | SpoolCancelable | 0 `SPOOL_CANCEL`  | none                                       |
//! | SpawnStreaming  | 0 `SPAWN_KILL`    | 0 `KILL_OK` / 1 `KILL_ERROR(msg)`          |

use serde_json::{json, Value};
use tokio::sync::mpsc;

// =============================================================================
// Request Opcodes
// =============================================================================

/// Initial state: spool an app.
pub const OP_SPOOL: u32 = 0;
/// Initial state: spawn a worker.
pub const OP_SPAWN: u32 = 1;
/// SpoolCancelable state: cancel the running spool.
pub const OP_SPOOL_CANCEL: u32 = 0;
/// SpawnStreaming state: kill the spawned worker.
pub const OP_SPAWN_KILL: u32 = 0;

/// Error-code pair carried by spool and spawn error replies. The wire
/// peer expects this exact pair; it must not change until the peer is
/// upgraded.
pub const ERROR_CATEGORY: [i64; 2] = [42, 42];

// =============================================================================
// Messages
// =============================================================================

/// One framed request message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Transition id within the current dispatch state.
    pub opcode: u32,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl Message {
    pub fn new(opcode: u32, args: Vec<Value>) -> Self {
        Self { opcode, args }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// One framed reply message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Spool finished successfully.
    SpoolOk,
    /// Spool failed.
    SpoolError { code: [i64; 2], message: String },
    /// A chunk of worker output.
    SpawnWrite { data: Vec<u8> },
    /// Spawn or its output stream failed.
    SpawnError { code: [i64; 2], message: String },
    /// The output stream ended cleanly.
    SpawnClose,
    /// The worker was killed.
    KillOk,
    /// The kill failed.
    KillError { message: String },
}

impl Reply {
    /// Spool error with the protocol-fixed code pair.
    pub fn spool_error(message: impl Into<String>) -> Self {
        Reply::SpoolError {
            code: ERROR_CATEGORY,
            message: message.into(),
        }
    }

    /// Spawn error with the protocol-fixed code pair.
    pub fn spawn_error(message: impl Into<String>) -> Self {
        Reply::SpawnError {
            code: ERROR_CATEGORY,
            message: message.into(),
        }
    }

    /// Reply opcode within the originating request's reply space.
    pub fn opcode(&self) -> u32 {
        match self {
            Reply::SpoolOk | Reply::SpawnWrite { .. } | Reply::KillOk => 0,
            Reply::SpoolError { .. } | Reply::SpawnError { .. } | Reply::KillError { .. } => 1,
            Reply::SpawnClose => 2,
        }
    }

    /// Renders the reply as an `(opcode, args)` frame for the transport.
    pub fn into_frame(self) -> (u32, Vec<Value>) {
        let opcode = self.opcode();
        let args = match self {
            Reply::SpoolOk | Reply::SpawnClose | Reply::KillOk => Vec::new(),
            Reply::SpoolError { code, message } | Reply::SpawnError { code, message } => {
                vec![json!(code), json!(message)]
            }
            Reply::SpawnWrite { data } => vec![json!(data)],
            Reply::KillError { message } => vec![json!(message)],
        };
        (opcode, args)
    }
}

/// Sends replies back onto the session channel.
pub type ReplySender = mpsc::UnboundedSender<Reply>;

// =============================================================================
// Worker Output
// =============================================================================

/// One chunk of a worker's output stream.
#[derive(Debug, Clone)]
pub enum Output {
    /// Bytes from the worker's stdout/stderr.
    Data(Vec<u8>),
    /// A fault in the stream.
    Error(String),
}

/// Bytestream sink attached to a container; the session's output pump
/// drains the other end.
pub type OutputSender = mpsc::UnboundedSender<Output>;

/// Receiving side of a container output stream.
pub type OutputReceiver = mpsc::UnboundedReceiver<Output>;
