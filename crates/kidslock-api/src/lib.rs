//! Protocol types for kidslockd IPC
//!
//! This crate defines the stable API between kidslockd and clients:
//! - Commands (requests from clients)
//! - Responses
//! - Events (service -> clients), including retained device state
//! - Device definitions and weekly schedules shared with config and store

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
