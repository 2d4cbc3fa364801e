//! Reconciliation engine for kidslockd
//!
//! This crate is the heart of kidslockd, containing:
//! - Decision rules (daily budget, bedtime window, manual override)
//! - The device registry and its persisted counters
//! - The engine that mutates state and plans device commands
//! - The tick driver that probes devices and executes those plans

mod decision;
mod engine;
mod events;
mod reconciler;
mod registry;

pub use decision::*;
pub use engine::*;
pub use events::*;
pub use reconciler::*;
pub use registry::*;
