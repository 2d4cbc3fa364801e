//! Device registry persistence for kidslockd
//!
//! Definitions and their per-weekday schedule rows, the daily counters that
//! must survive a restart, and an append-only audit log. SQLite is the only
//! backend; the engine talks to it through the [`Store`] trait.

mod audit;
mod sqlite;
mod traits;

pub use audit::*;
pub use sqlite::*;
pub use traits::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Database(String),

    #[error("could not encode audit event: {0}")]
    Serialization(String),

    #[error("no stored device '{0}'")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
