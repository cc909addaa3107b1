//! Worker lifecycle management.
//!
//! - [`manager`] - spawns workers, registers them with the router and drives
//!   graceful shutdown.
//! - [`worker`] - the per-worker task: pulls offers when it has a free slot
//!   and echoes each accepted connection.

pub mod manager;
pub mod worker;

use turnstile::{Connection, LocalWorkerChannel, RouterHandle};

/// Router handle type shared by the pool and its workers.
pub type RouterClient = RouterHandle<Connection, LocalWorkerChannel<Connection>>;
