//! Single-owner task driving a [`Router`].
//!
//! Every router operation becomes a [`Command`] on a bounded mailbox. The
//! actor applies commands and handoff replies one at a time, so the registry
//! and both queues are never touched concurrently even on a multi-threaded
//! runtime.

use super::{OnReady, Router, RouterStats, WorkerId};
use crate::{
    channel::WorkerChannel,
    error::{BindError, Error, Result},
    handle::ConnectionHandle,
    listener::ListenerControl,
};
use std::net::SocketAddr;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

enum Command<H, C> {
    Register {
        id: WorkerId,
        channel: C,
        on_ready: OnReady,
        response: oneshot::Sender<Result<()>>,
    },
    Distribute(H),
    Unregister {
        id: WorkerId,
        response: oneshot::Sender<bool>,
    },
    Listening(core::result::Result<(), BindError>),
    Stats {
        response: oneshot::Sender<RouterStats>,
    },
}

/// Cloneable handle to a router actor started with [`spawn_router`].
///
/// The actor keeps running while at least one handle is alive.
pub struct RouterHandle<H, C> {
    tx: mpsc::Sender<Command<H, C>>,
}

impl<H, C> Clone for RouterHandle<H, C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Resolves once the shared listener is ready for a registered worker.
#[derive(Debug)]
pub struct Ready {
    rx: oneshot::Receiver<Result<Option<SocketAddr>>>,
}

impl Ready {
    /// Waits for the listener's address (`None` for path based listeners).
    ///
    /// # Errors
    ///
    /// Returns the bind error, [`Error::ListenerStopped`], or a channel error
    /// if the worker was unregistered before the listener became ready.
    pub async fn wait(self) -> Result<Option<SocketAddr>> {
        self.rx.await.map_err(|_| Error::ChannelError {
            context: "readiness notification dropped".to_string(),
        })?
    }
}

impl<H, C> RouterHandle<H, C>
where
    H: ConnectionHandle,
    C: WorkerChannel<H>,
{
    /// Registers a worker; `on_ready` fires once the listener is bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateWorker`] for an id that is still registered,
    /// or [`Error::RouterShutdown`] if the actor is gone.
    pub async fn register_worker(&self, id: WorkerId, channel: C, on_ready: OnReady) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(Command::Register {
            id,
            channel,
            on_ready,
            response,
        })
        .await?;
        rx.await.map_err(|_| Error::RouterShutdown)?
    }

    /// Registers a worker and returns a [`Ready`] to await the listener.
    ///
    /// # Errors
    ///
    /// See [`RouterHandle::register_worker`].
    pub async fn register(&self, id: WorkerId, channel: C) -> Result<Ready> {
        let (tx, rx) = oneshot::channel();
        self.register_worker(
            id,
            channel,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await?;
        Ok(Ready { rx })
    }

    /// Hands an accepted connection to the router.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterShutdown`] if the actor is gone, in which case
    /// the connection has been closed.
    pub async fn distribute(&self, handle: H) -> Result<()> {
        if let Err(err) = self.tx.send(Command::Distribute(handle)).await {
            if let Command::Distribute(handle) = err.0 {
                handle.close();
            }
            return Err(Error::RouterShutdown);
        }
        Ok(())
    }

    /// Removes a worker. `Ok(true)` means it was the last one and the
    /// listener has been stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterShutdown`] if the actor is gone.
    pub async fn unregister_worker(&self, id: WorkerId) -> Result<bool> {
        let (response, rx) = oneshot::channel();
        self.send(Command::Unregister { id, response }).await?;
        rx.await.map_err(|_| Error::RouterShutdown)
    }

    /// Reports the outcome of the listener's bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouterShutdown`] if the actor is gone.
    pub async fn listening(&self, result: core::result::Result<(), BindError>) -> Result<()> {
        self.send(Command::Listening(result)).await
    }

    /// # Errors
    ///
    /// Returns [`Error::RouterShutdown`] if the actor is gone.
    pub async fn stats(&self) -> Result<RouterStats> {
        let (response, rx) = oneshot::channel();
        self.send(Command::Stats { response }).await?;
        rx.await.map_err(|_| Error::RouterShutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command<H, C>) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::RouterShutdown)
    }
}

/// Starts a router actor for `listener`.
///
/// `mailbox_size` bounds the number of queued commands; a full mailbox applies
/// backpressure to the accept loop. The returned task resolves to the final
/// [`RouterStats`] once every [`RouterHandle`] has been dropped.
pub fn spawn_router<H, C, L>(
    listener: L,
    mailbox_size: usize,
) -> (RouterHandle<H, C>, JoinHandle<RouterStats>)
where
    H: ConnectionHandle,
    C: WorkerChannel<H>,
    L: ListenerControl,
{
    let (tx, rx) = mpsc::channel(mailbox_size);
    let task = tokio::spawn(router_loop(Router::new(listener), rx));
    (RouterHandle { tx }, task)
}

async fn router_loop<H, C, L>(
    mut router: Router<H, C, L>,
    mut rx: mpsc::Receiver<Command<H, C>>,
) -> RouterStats
where
    H: ConnectionHandle,
    C: WorkerChannel<H>,
    L: ListenerControl,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Router started");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => apply(&mut router, command),
                None => break,
            },
            Some(completion) = router.next_completion(), if router.has_in_flight() => {
                router.complete(completion);
            }
        }
    }

    router.shutdown();
    let stats = router.stats();

    #[cfg(feature = "tracing")]
    tracing::debug!("Router stopped: {stats:?}");

    stats
}

fn apply<H, C, L>(router: &mut Router<H, C, L>, command: Command<H, C>)
where
    H: ConnectionHandle,
    C: WorkerChannel<H>,
    L: ListenerControl,
{
    match command {
        Command::Register {
            id,
            channel,
            on_ready,
            response,
        } => {
            let _ = response.send(router.register_worker(id, channel, on_ready));
        }
        Command::Distribute(handle) => router.distribute(handle),
        Command::Unregister { id, response } => {
            let _ = response.send(router.unregister_worker(id));
        }
        Command::Listening(result) => router.listening(result),
        Command::Stats { response } => {
            let _ = response.send(router.stats());
        }
    }
}
