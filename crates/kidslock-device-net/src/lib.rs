//! Network adapters for kidslockd
//!
//! Provides:
//! - Reachability probing by TCP connect or ICMP echo
//! - The HTTP client for a device's lock control endpoint

mod prober;
mod remote;

pub use prober::*;
pub use remote::*;
