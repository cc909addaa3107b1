use crate::server::{
    pool::RouterClient,
    telemetry::{
        decrement_connections_active, increment_connections_active, increment_connections_served,
        increment_handoffs_accepted, increment_handoffs_rejected, record_connection_duration,
    },
};
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    task::JoinSet,
    time::timeout,
};
use turnstile::{Connection, Offer, WorkerId};

/// Connections being served across every worker in the process.
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
}

/// Control messages from the pool manager.
#[derive(Debug)]
pub enum WorkRequest {
    Shutdown { response: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
    pub announce: bool,
}

/// Worker task serving connections handed over by the router.
///
/// The worker only pulls an offer from its mailbox once it holds a free
/// connection slot. While it is at its limit the offer stays in flight, the
/// router counts the worker as busy and new connections go elsewhere.
///
/// On [`WorkRequest::Shutdown`] the worker drains:
///
/// 1. unregisters from the router so no new offers arrive,
/// 2. rejects offers still sitting in its mailbox,
/// 3. waits up to `shutdown_timeout` for open connections, then aborts them,
/// 4. acknowledges.
pub async fn worker_loop(
    id: WorkerId,
    router: RouterClient,
    mut offers: mpsc::Receiver<Offer<Connection>>,
    mut control: mpsc::Receiver<WorkRequest>,
    settings: WorkerSettings,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {id} started");

    let slots = Arc::new(Semaphore::new(settings.max_connections));
    let mut connections = JoinSet::new();
    let mut permit: Option<OwnedSemaphorePermit> = None;

    let response = loop {
        tokio::select! {
            biased;
            request = control.recv() => match request {
                Some(WorkRequest::Shutdown { response }) => break Some(response),
                None => break None,
            },
            Some(_joined) = connections.join_next(), if !connections.is_empty() => {
                #[cfg(feature = "tracing")]
                if let Err(_e) = _joined {
                    tracing::error!("Worker {id} connection task failed: {_e}");
                }
            }
            acquired = Arc::clone(&slots).acquire_owned(), if permit.is_none() => {
                // The semaphore is never closed.
                permit = acquired.ok();
            }
            offer = offers.recv(), if permit.is_some() => {
                let Some(offer) = offer else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {id} mailbox closed by the router");
                    break None;
                };
                let conn = offer.accept();
                increment_handoffs_accepted();
                connections.spawn(serve_connection(id, conn, permit.take(), settings.announce));
            }
        }
    };

    #[cfg(feature = "tracing")]
    tracing::debug!("Worker {id} received shutdown signal");

    drain(id, &router, &mut offers, &mut connections, settings.shutdown_timeout).await;

    if let Some(response) = response {
        if response.send(()).is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {id} failed to acknowledge shutdown");
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {id} stopped");
}

async fn drain(
    id: WorkerId,
    router: &RouterClient,
    offers: &mut mpsc::Receiver<Offer<Connection>>,
    connections: &mut JoinSet<()>,
    shutdown_timeout: Duration,
) {
    // === Phase 1: Leave the router ===
    match router.unregister_worker(id).await {
        Ok(true) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Worker {id} was the last one, listener stopped");
        }
        Ok(false) => {}
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {id} could not unregister: {_e}");
        }
    }

    // === Phase 2: Hand back offers that were never picked up ===
    offers.close();
    while let Some(offer) = offers.recv().await {
        increment_handoffs_rejected();
        offer.reject();
    }

    // === Phase 3: Wait for open connections ===
    #[cfg(feature = "tracing")]
    tracing::debug!(
        "Worker {id} draining {} open connections",
        connections.len()
    );
    let drained = timeout(shutdown_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Worker {id} drain timed out, aborting {} connections",
            connections.len()
        );
        connections.shutdown().await;
    }
}

/// Echoes everything the peer sends until it closes the connection.
async fn serve_connection(
    id: WorkerId,
    mut conn: Connection,
    _permit: Option<OwnedSemaphorePermit>,
    announce: bool,
) {
    let started = Instant::now();
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    increment_connections_active();

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {id} serving {:?}", conn.peer_addr());

    if let Err(_e) = echo(id, &mut conn, announce).await {
        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {id} connection ended with error: {_e}");
    }

    ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    decrement_connections_active();
    increment_connections_served();
    record_connection_duration(started.elapsed().as_secs_f64() * 1000.0);
}

async fn echo(id: WorkerId, conn: &mut Connection, announce: bool) -> std::io::Result<()> {
    if announce {
        conn.write_all(format!("worker {id}\n").as_bytes()).await?;
    }

    let mut buf = vec![0_u8; 8 * 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return conn.shutdown().await;
        }
        conn.write_all(&buf[..n]).await?;
    }
}
