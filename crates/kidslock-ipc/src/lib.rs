//! Local control socket for kidslockd
//!
//! One JSON document per line in both directions. Requests carry a
//! `request_id` that the matching response echoes; events have none and
//! only reach clients that subscribed. Clients are given the admin role when
//! their peer uid is root or the daemon's own uid, observer otherwise.

mod client;
mod server;

pub use client::*;
pub use server::*;

use kidslock_api::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON line: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("unexpected message: {0}")]
    InvalidMessage(String),

    #[error("server not listening")]
    NotStarted,

    #[error("{code:?}: {message}")]
    Rejected { code: ErrorCode, message: String },
}

pub type IpcResult<T> = Result<T, IpcError>;
