//! Boundary traits for kidslockd
//!
//! This crate defines the interfaces between the reconciliation engine and
//! the outside world: probing devices, sending lock/unlock commands and
//! publishing device state. It contains no network code itself; mock
//! implementations are provided for tests.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
