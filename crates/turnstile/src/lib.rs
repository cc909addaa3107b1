//! # `turnstile`: one listening socket, many workers
//!
//! `turnstile` shares a single bound listening socket among a pool of workers.
//! The process that owns the socket accepts connections and hands each one to
//! exactly one worker, tracking which workers have spare capacity and which
//! connections are still waiting for a taker.
//!
//! ## Highlights
//!
//! - **Idle-worker-first dispatch**: connections go to workers in the order in
//!   which they signaled spare capacity. This is not round robin: a worker that
//!   finishes quickly can receive two connections in a row while a slower
//!   sibling is still busy.
//! - **Accept/reject handoff**: every connection is *offered* to a worker
//!   through a one-shot [`Offer`]. Accepting is the only way to take ownership
//!   of the handle and rejecting hands it back to the router, which requeues
//!   it.
//! - **No loss, no duplication**: a handle is always in exactly one place:
//!   the pending queue, in flight to one worker, or closed.
//! - **Teardown drains**: when the last worker leaves, queued handles are
//!   closed and the listener is stopped before the call returns.
//!
//! ## Architecture
//!
//! - [`Router`] is the synchronous state machine: worker registry, idle queue,
//!   pending queue and the handoff bookkeeping.
//! - [`spawn_router`] runs a [`Router`] as a single-owner Tokio actor and
//!   returns a cloneable [`RouterHandle`].
//! - [`ListenerFacade`] binds a TCP address or Unix socket path and feeds
//!   accepted [`Connection`]s into the router.
//! - [`LocalWorkerChannel`] is an in-process [`WorkerChannel`] backed by a
//!   bounded Tokio channel.
//!
//! ## Example
//!
//! ```rust,no_run
//! use turnstile::{
//!     BindOptions, BindTarget, Connection, ListenerFacade, LocalWorkerChannel, WorkerId,
//!     local_channel, spawn_router,
//! };
//!
//! # async fn run() -> turnstile::Result<()> {
//! let facade = ListenerFacade::new(BindTarget::tcp("127.0.0.1:8080"), BindOptions::default());
//! let (router, _actor) =
//!     spawn_router::<Connection, LocalWorkerChannel<Connection>, _>(facade.clone(), 1024);
//!
//! let (channel, mut offers) = local_channel::<Connection>();
//! tokio::spawn(async move {
//!     while let Some(offer) = offers.recv().await {
//!         let _conn = offer.accept();
//!         // serve the connection...
//!     }
//! });
//!
//! let ready = router.register(WorkerId(0), channel).await?;
//! let _accept_loop = facade.start(router.clone());
//! let addr = ready.wait().await?;
//! println!("serving on {addr:?}");
//! # Ok(())
//! # }
//! ```

mod channel;
mod error;
mod handle;
mod idle;
mod listener;
mod router;

pub use crate::channel::*;
pub use crate::error::*;
pub use crate::handle::*;
pub use crate::listener::*;
pub use crate::router::*;
