use super::{ListenerState, OnReady, RouterStats, WorkerId};
use crate::{
    channel::{Message, Offer, Reply, SendError, WorkerChannel},
    error::{BindError, Error, Result},
    handle::ConnectionHandle,
    idle::IdleQueue,
    listener::ListenerControl,
};
use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

struct WorkerRecord<C> {
    channel: C,
    /// Distinguishes this registration from earlier ones under the same id.
    generation: u64,
    /// An offer is outstanding.
    busy: bool,
}

/// The outcome of one handoff, ready to be folded back into the [`Router`]
/// with [`Router::complete`].
pub struct Completion<H> {
    worker: WorkerId,
    generation: u64,
    seq: u64,
    outcome: core::result::Result<Reply<H>, oneshot::error::RecvError>,
}

impl<H> Completion<H> {
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

/// Connection router state machine.
///
/// Owns the worker registry, the FIFO of idle workers and the FIFO of pending
/// connections. Every method runs to completion; the only deferred work is
/// the reply to an offer, surfaced through [`Router::next_completion`] and
/// applied with [`Router::complete`]. The router is not `Sync` in spirit:
/// drive it from a single task, e.g. with [`spawn_router`].
///
/// A connection handle is always in exactly one place: the pending queue, in
/// flight inside an [`Offer`], or closed.
///
/// [`spawn_router`]: crate::spawn_router
pub struct Router<H, C, L> {
    workers: HashMap<WorkerId, WorkerRecord<C>>,
    idle: IdleQueue,
    pending: VecDeque<H>,
    waiting: Vec<(WorkerId, OnReady)>,
    listener: L,
    state: ListenerState,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion<H>>>,
    next_seq: u64,
    next_generation: u64,
    accepted: u64,
    rejected: u64,
    lost: u64,
    closed: u64,
}

impl<H, C, L> Router<H, C, L>
where
    H: ConnectionHandle,
    C: WorkerChannel<H>,
    L: ListenerControl,
{
    /// Creates a router for a listener that has not finished binding yet.
    pub fn new(listener: L) -> Self {
        Self {
            workers: HashMap::new(),
            idle: IdleQueue::default(),
            pending: VecDeque::new(),
            waiting: Vec::new(),
            listener,
            state: ListenerState::Binding,
            in_flight: FuturesUnordered::new(),
            next_seq: 0,
            next_generation: 0,
            accepted: 0,
            rejected: 0,
            lost: 0,
            closed: 0,
        }
    }

    pub const fn listener_state(&self) -> &ListenerState {
        &self.state
    }

    pub fn is_registered(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn is_idle(&self, id: WorkerId) -> bool {
        self.idle.contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            registered: self.workers.len(),
            idle: self.idle.len(),
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            accepted: self.accepted,
            rejected: self.rejected,
            lost: self.lost,
            closed: self.closed,
        }
    }

    /// Adds a worker to the registry.
    ///
    /// If the listener is bound, `on_ready` runs immediately with its address
    /// and the worker is offered any connection that queued up while nobody
    /// was idle. Otherwise both steps wait for [`Router::listening`]. After a
    /// bind failure or teardown `on_ready` receives the error right away and
    /// the worker is never dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateWorker`] if `id` is already registered;
    /// `on_ready` is dropped without being called.
    pub fn register_worker(&mut self, id: WorkerId, channel: C, on_ready: OnReady) -> Result<()> {
        if self.workers.contains_key(&id) {
            return Err(Error::DuplicateWorker(id));
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.workers.insert(
            id,
            WorkerRecord {
                channel,
                generation,
                busy: false,
            },
        );

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {id} registered ({} total)", self.workers.len());

        match self.state.clone() {
            ListenerState::Bound => {
                on_ready(Ok(self.listener.local_address()));
                self.dispatch(id);
            }
            ListenerState::Binding => self.waiting.push((id, on_ready)),
            ListenerState::Failed(err) => on_ready(Err(Error::Bind(err))),
            ListenerState::Stopped => on_ready(Err(Error::ListenerStopped)),
        }
        Ok(())
    }

    /// One-shot readiness notification from the listener.
    ///
    /// Later notifications are ignored.
    pub fn listening(&mut self, result: core::result::Result<(), BindError>) {
        if self.state != ListenerState::Binding {
            return;
        }

        let waiting = std::mem::take(&mut self.waiting);
        match result {
            Ok(()) => {
                self.state = ListenerState::Bound;
                let addr = self.listener.local_address();

                #[cfg(feature = "tracing")]
                tracing::info!(
                    "Listener ready on {addr:?}, releasing {} waiting workers",
                    waiting.len()
                );

                for (id, on_ready) in waiting {
                    on_ready(Ok(addr));
                    self.dispatch(id);
                }
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!("{err}");

                self.state = ListenerState::Failed(err.clone());
                for (_, on_ready) in waiting {
                    on_ready(Err(Error::Bind(err.clone())));
                }
            }
        }
    }

    /// Queues an accepted connection and wakes the longest-idle worker.
    ///
    /// After teardown there is nobody to hand the connection to and it is
    /// closed.
    pub fn distribute(&mut self, handle: H) {
        if self.state == ListenerState::Stopped {
            self.close(handle);
            return;
        }

        self.pending.push_back(handle);
        if let Some(id) = self.idle.pop() {
            self.dispatch(id);
        }
    }

    /// Removes a worker from the registry.
    ///
    /// Returns `true` when this was the last worker: every queued connection
    /// has been closed and the listener stopped. Unknown ids are a no-op
    /// returning `false`.
    ///
    /// An offer already sent to the worker is not rescinded. Its reply is
    /// processed normally; a rejected handle is requeued for the remaining
    /// workers.
    pub fn unregister_worker(&mut self, id: WorkerId) -> bool {
        if self.workers.remove(&id).is_none() {
            return false;
        }
        self.idle.remove(id);
        self.waiting.retain(|(waiting, _)| *waiting != id);

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {id} unregistered ({} left)", self.workers.len());

        if !self.workers.is_empty() {
            return false;
        }

        self.teardown();
        true
    }

    /// Waits for the next handoff reply. Resolves to `None` when nothing is
    /// in flight.
    pub async fn next_completion(&mut self) -> Option<Completion<H>> {
        self.in_flight.next().await
    }

    /// Applies a handoff reply.
    ///
    /// - Accepted: the worker owns the connection; offer it more work.
    /// - Rejected: the connection is distributed again as if freshly
    ///   accepted, then the rejecting worker is dispatched again as well.
    /// - Lost: the offer was dropped and the connection closed with it.
    pub fn complete(&mut self, completion: Completion<H>) {
        let Completion {
            worker,
            generation,
            seq: _seq,
            outcome,
        } = completion;

        // Replies for a worker that left (or left and came back under the same
        // id) are still applied, but never dispatch that worker again.
        let current = match self.workers.get_mut(&worker) {
            Some(record) if record.generation == generation => {
                record.busy = false;
                true
            }
            _ => false,
        };

        match outcome {
            Ok(Reply::Accepted) => {
                self.accepted += 1;

                #[cfg(feature = "tracing")]
                tracing::trace!("Worker {worker} accepted connection {_seq}");
            }
            Ok(Reply::Rejected(handle)) => {
                self.rejected += 1;

                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker} rejected connection {_seq}");

                self.distribute(handle);
            }
            Err(_) => {
                self.lost += 1;

                #[cfg(feature = "tracing")]
                tracing::warn!("Worker {worker} dropped connection {_seq} without replying");
            }
        }

        if current {
            self.dispatch(worker);
        }
    }

    /// Tears the router down: closes queued connections, stops the listener
    /// and forgets every worker. Outstanding offers are abandoned; a worker
    /// that rejects one afterwards closes the connection itself.
    pub fn shutdown(&mut self) {
        self.workers.clear();
        self.idle = IdleQueue::default();
        self.waiting.clear();
        self.teardown();
        self.in_flight = FuturesUnordered::new();
    }

    /// Offers the head of the pending queue to `id`, or marks it idle.
    fn dispatch(&mut self, id: WorkerId) {
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        debug_assert!(!record.busy, "worker {id} already has an offer outstanding");
        if record.busy {
            return;
        }

        let Some(handle) = self.pending.pop_front() else {
            self.idle.push(id);
            return;
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let (offer, rx) = Offer::new(Message::NewConnection { seq }, handle);

        match record.channel.send(offer) {
            Ok(()) => {
                record.busy = true;
                let generation = record.generation;
                self.in_flight.push(
                    async move {
                        Completion {
                            worker: id,
                            generation,
                            seq,
                            outcome: rx.await,
                        }
                    }
                    .boxed(),
                );
            }
            Err(SendError::Full(offer)) => {
                // The mailbox still holds an offer the worker has not picked
                // up. Keep the connection at the head of the queue and let
                // the worker come around again once the idle workers ahead
                // of it have had their turn.
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {id} mailbox is full, requeueing connection {seq}");

                drop(rx);
                self.pending.push_front(offer.into_handle());
                if let Some(next) = self.idle.pop() {
                    self.dispatch(next);
                }
                self.idle.push(id);
            }
            Err(SendError::Closed(offer)) => {
                // The worker is unreachable. Keep the connection at the head of
                // the queue and leave the worker neither idle nor busy until its
                // lifecycle manager unregisters it.
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker {id} is unreachable, requeueing connection {seq}");

                drop(rx);
                self.pending.push_front(offer.into_handle());
                if let Some(next) = self.idle.pop() {
                    self.dispatch(next);
                }
            }
        }
    }

    fn teardown(&mut self) {
        #[cfg(feature = "tracing")]
        let queued = self.pending.len();

        while let Some(handle) = self.pending.pop_front() {
            self.close(handle);
        }

        if self.state != ListenerState::Stopped {
            #[cfg(feature = "tracing")]
            tracing::info!(
                "No workers left, closed {queued} queued connections and stopping listener"
            );

            self.listener.stop();
            self.state = ListenerState::Stopped;
        }
    }

    fn close(&mut self, handle: H) {
        self.closed += 1;
        handle.close();
    }
}
