//! kidslockd service internals
//!
//! Wires together:
//! - Configuration loading and device seeding
//! - Store initialization
//! - The reconciliation engine and its tick driver
//! - The IPC server, which doubles as the retained device state bus

mod publisher;
mod service;

pub use publisher::*;
pub use service::*;
