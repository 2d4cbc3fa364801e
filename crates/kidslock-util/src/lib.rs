//! Shared utilities for kidslock
//!
//! This crate provides:
//! - ID types (DeviceId, ClientId)
//! - Time utilities (mockable wall clock, monotonic time, time-of-day)
//! - Rate limiting helpers
//! - Default paths for config, socket and data directories

mod ids;
mod paths;
mod rate_limit;
mod time;

pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use time::*;
