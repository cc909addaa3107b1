mod actor;
mod state;
#[cfg(test)]
mod tests;

pub use actor::*;
pub use state::*;

use crate::error::{BindError, Result};
use core::fmt;
use std::net::SocketAddr;

/// Identity of a worker, unique among currently registered workers.
///
/// The lifecycle manager may reuse an id once the previous holder has been
/// unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked once the shared listener is ready (or failed to bind).
///
/// Receives the bound address, or `None` for path based listeners.
pub type OnReady = Box<dyn FnOnce(Result<Option<SocketAddr>>) + Send + 'static>;

/// What the router knows about the shared listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Bind has not completed yet. Registrations wait for readiness.
    Binding,
    /// The listener is accepting connections.
    Bound,
    /// Bind failed. Every registration is told so through its `OnReady`.
    Failed(BindError),
    /// The last worker left and the listener was stopped.
    Stopped,
}

/// Point-in-time view of the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Workers currently registered.
    pub registered: usize,
    /// Registered workers waiting for a connection.
    pub idle: usize,
    /// Connections waiting for a worker.
    pub pending: usize,
    /// Offers sent whose reply has not been processed yet.
    pub in_flight: usize,
    /// Offers accepted by a worker.
    pub accepted: u64,
    /// Offers rejected and requeued.
    pub rejected: u64,
    /// Offers dropped by a worker without a reply.
    pub lost: u64,
    /// Connections closed by the router because nobody could take them.
    pub closed: u64,
}
