//! Pool of echo workers sharing the router's listener.
//!
//! [`WorkerPool`] spawns the workers, registers each one with the router and
//! coordinates shutdown. The pool never picks a worker for a connection; that
//! is the router's job. It only owns the workers' lifecycles.

use crate::server::{
    config::ServerConfig,
    pool::{
        RouterClient,
        worker::{WorkRequest, WorkerSettings, worker_loop},
    },
};
#[cfg(feature = "tracing")]
use crate::server::pool::worker::active_connections;
use core::time::Duration;
use std::net::SocketAddr;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use turnstile::{Ready, WorkerId, local_channel};

/// Extra time a worker gets to acknowledge shutdown after its own drain
/// timeout has elapsed.
const ACK_GRACE: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    workers: Vec<(WorkerId, mpsc::Sender<WorkRequest>)>,
    ready: Vec<Ready>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns `config.num_workers` workers and registers them with `router`.
    ///
    /// Registration happens before the listener starts so that every worker
    /// is released at once when the socket is bound.
    ///
    /// # Errors
    ///
    /// Fails if the router rejects a registration. Workers spawned so far are
    /// shut down first.
    pub async fn spawn(config: &ServerConfig, router: &RouterClient) -> turnstile::Result<Self> {
        let settings = WorkerSettings {
            max_connections: config.max_connections_per_worker,
            shutdown_timeout: config.shutdown_timeout,
            announce: config.announce,
        };

        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            ready: Vec::with_capacity(config.num_workers),
            shutdown_timeout: config.shutdown_timeout,
        };

        for index in 0..config.num_workers {
            let id = WorkerId(index);
            // One outstanding offer per worker; the router never sends more.
            let (channel, offers) = local_channel();
            let (control_tx, control_rx) = mpsc::channel(1);

            let ready = match router.register(id, channel).await {
                Ok(ready) => ready,
                Err(err) => {
                    pool.shutdown().await;
                    return Err(err);
                }
            };

            tokio::spawn(worker_loop(
                id,
                router.clone(),
                offers,
                control_rx,
                settings,
            ));
            pool.workers.push((id, control_tx));
            pool.ready.push(ready);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawned {} workers", pool.workers.len());

        Ok(pool)
    }

    /// Waits until the listener is ready for every worker.
    ///
    /// # Errors
    ///
    /// Returns the first readiness error, typically a bind failure.
    pub async fn wait_ready(&mut self) -> turnstile::Result<Option<SocketAddr>> {
        let ready = std::mem::take(&mut self.ready);
        let addrs = futures::future::try_join_all(ready.into_iter().map(Ready::wait)).await?;
        Ok(addrs.into_iter().next().flatten())
    }

    /// Gracefully shuts down every worker.
    ///
    /// - Each worker unregisters, hands back unclaimed offers and drains its
    ///   connections (up to the shutdown timeout).
    /// - The last worker to unregister stops the listener.
    /// - Acknowledgements are awaited with a short grace period on top of
    ///   the drain timeout.
    pub async fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining {} workers ({} active connections)",
            self.workers.len(),
            active_connections()
        );

        let mut acks = Vec::with_capacity(self.workers.len());
        for (id, worker) in &self.workers {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to worker {id}: {_e}");
            } else {
                acks.push((*id, rx));
            }
        }

        let wait = self.shutdown_timeout + ACK_GRACE;
        let ack_futures = acks.into_iter().map(|(_id, rx)| async move {
            match timeout(wait, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_id} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_id} dropped its acknowledgement: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_id} shutdown timed out");
                }
            }
        });

        futures::future::join_all(ack_futures).await;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Worker pool shutdown complete ({} connections still open)",
            active_connections()
        );
    }
}
