//! Handoff protocol between the router and its workers.
//!
//! The router never pushes a connection onto a worker. It *offers* it: an
//! [`Offer`] bundles the tagged [`Message`], the handle and a one-shot reply.
//! The worker answers exactly once:
//!
//! - [`Offer::accept`] hands the connection to the worker and tells the router
//!   the transfer is complete.
//! - [`Offer::reject`] gives the connection back to the router, which requeues
//!   it.
//!
//! Because both consume the offer, a second answer is unrepresentable. Holding
//! an offer without answering is allowed: the handle then stays in flight for
//! as long as the worker keeps it. Dropping an offer closes the handle with it
//! and the router observes a lost reply.

use crate::handle::ConnectionHandle;
use core::fmt;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

/// Tagged message that travels with every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// A freshly accepted connection. `seq` is unique per router.
    NewConnection { seq: u64 },
}

/// A worker's answer to an [`Offer`].
#[derive(Debug)]
pub enum Reply<H> {
    /// The worker took ownership of the handle.
    Accepted,
    /// The worker declined; the handle travels back to the router.
    Rejected(H),
}

/// One connection offered to one worker.
pub struct Offer<H: ConnectionHandle> {
    message: Message,
    // `None` once the offer has been answered.
    parts: Option<Parts<H>>,
}

struct Parts<H> {
    handle: H,
    reply: oneshot::Sender<Reply<H>>,
}

impl<H: ConnectionHandle> Offer<H> {
    pub(crate) fn new(message: Message, handle: H) -> (Self, oneshot::Receiver<Reply<H>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                message,
                parts: Some(Parts { handle, reply }),
            },
            rx,
        )
    }

    pub const fn message(&self) -> Message {
        self.message
    }

    /// Borrow the offered handle, e.g. to inspect the peer before deciding.
    pub fn handle(&self) -> &H {
        match &self.parts {
            Some(parts) => &parts.handle,
            None => unreachable!("offer answered twice"),
        }
    }

    /// Takes ownership of the connection and notifies the router.
    ///
    /// The worker keeps the handle even if the router has already gone away.
    pub fn accept(mut self) -> H {
        let Parts { handle, reply } = self.take_parts();
        let _ = reply.send(Reply::Accepted);
        handle
    }

    /// Declines the connection and returns it to the router.
    ///
    /// If the router is gone there is nobody to return it to and the handle is
    /// closed.
    pub fn reject(mut self) {
        let Parts { handle, reply } = self.take_parts();
        if let Err(Reply::Rejected(handle)) = reply.send(Reply::Rejected(handle)) {
            handle.close();
        }
    }

    /// Recovers the handle of an offer that never reached its worker.
    pub(crate) fn into_handle(mut self) -> H {
        self.take_parts().handle
    }

    fn take_parts(&mut self) -> Parts<H> {
        match self.parts.take() {
            Some(parts) => parts,
            None => unreachable!("offer answered twice"),
        }
    }
}

impl<H: ConnectionHandle> Drop for Offer<H> {
    fn drop(&mut self) {
        // Unanswered: the reply sender goes with it and the router sees a
        // lost reply.
        if let Some(Parts { handle, reply }) = self.parts.take() {
            drop(reply);
            handle.close();
        }
    }
}

impl<H: ConnectionHandle> fmt::Debug for Offer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offer")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Why an offer could not be delivered. Either way the offer comes back
/// untouched.
#[derive(Debug)]
pub enum SendError<H: ConnectionHandle> {
    /// The worker's mailbox still holds an offer it has not picked up.
    Full(Offer<H>),
    /// The worker is gone.
    Closed(Offer<H>),
}

impl<H: ConnectionHandle> SendError<H> {
    pub fn into_offer(self) -> Offer<H> {
        match self {
            Self::Full(offer) | Self::Closed(offer) => offer,
        }
    }
}

/// Transport used by the router to reach a single worker.
///
/// Implementations must deliver offers to one worker in FIFO order. The
/// router guarantees at most one outstanding offer per worker, so a transport
/// never has to buffer more than one.
///
/// Cross-process implementations move the descriptor with the message (e.g.
/// `SCM_RIGHTS`) and close their local copy once the worker accepts.
pub trait WorkerChannel<H: ConnectionHandle>: Send + 'static {
    /// Delivers `offer` to the worker.
    ///
    /// # Errors
    ///
    /// Returns the untouched offer if the worker cannot take it right now
    /// ([`SendError::Full`]) or cannot be reached at all
    /// ([`SendError::Closed`]), so the handle inside is never lost.
    fn send(&self, offer: Offer<H>) -> core::result::Result<(), SendError<H>>;
}

/// In-process [`WorkerChannel`] backed by a bounded Tokio MPSC channel.
pub struct LocalWorkerChannel<H: ConnectionHandle> {
    tx: mpsc::Sender<Offer<H>>,
}

impl<H: ConnectionHandle> Clone for LocalWorkerChannel<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<H: ConnectionHandle> LocalWorkerChannel<H> {
    pub fn new(tx: mpsc::Sender<Offer<H>>) -> Self {
        Self { tx }
    }

    /// Returns `true` once the worker dropped its receiving half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<H: ConnectionHandle> WorkerChannel<H> for LocalWorkerChannel<H> {
    fn send(&self, offer: Offer<H>) -> core::result::Result<(), SendError<H>> {
        self.tx.try_send(offer).map_err(|err| match err {
            TrySendError::Full(offer) => SendError::Full(offer),
            TrySendError::Closed(offer) => SendError::Closed(offer),
        })
    }
}

/// Creates a worker mailbox.
///
/// A capacity of one is enough: the router never has more than one offer
/// outstanding per worker, and the worker has always taken the previous offer
/// out of the channel before it could answer it.
pub fn local_channel<H: ConnectionHandle>() -> (LocalWorkerChannel<H>, mpsc::Receiver<Offer<H>>) {
    let (tx, rx) = mpsc::channel(1);
    (LocalWorkerChannel::new(tx), rx)
}
