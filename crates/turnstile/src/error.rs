//! Error types for the connection router.
//!
//! [`Error`] captures every reportable failure of the router and its
//! collaborators. It is `Clone` because a single bind failure is fanned out to
//! every worker waiting for the listener to become ready.
//!
//! ## Error Cases
//! - `ChannelError`: the router actor or a worker mailbox could not be
//!   reached.
//! - `Bind`: the listener failed to bind its address or path.
//! - `DuplicateWorker`: a worker id was registered twice.
//! - `ListenerStopped`: the listener was torn down after the last worker left.
//! - `RouterShutdown`: the router actor has exited.

use crate::router::WorkerId;
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the connection router.
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The shared listener could not be bound.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// The worker id is already present in the registry.
    #[error("Worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    /// The listener was stopped because no workers remain.
    #[error("Listener has been stopped")]
    ListenerStopped,

    /// The router actor is no longer running.
    #[error("Router has shut down")]
    RouterShutdown,
}

/// A bind failure, detached from the originating [`io::Error`] so it can be
/// cloned and delivered to several workers.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to bind {target}: {message}")]
pub struct BindError {
    /// The address or path that was being bound.
    pub target: String,
    /// Kind of the underlying I/O error.
    pub kind: io::ErrorKind,
    /// Raw OS error code, when the failure came from the OS.
    pub errno: Option<i32>,
    /// Human readable description of the underlying error.
    pub message: String,
}

impl BindError {
    pub fn new(target: impl Into<String>, err: &io::Error) -> Self {
        Self {
            target: target.into(),
            kind: err.kind(),
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}
