use super::*;
use crate::{
    channel::{Offer, SendError, WorkerChannel, local_channel},
    error::Error,
    handle::ConnectionHandle,
    listener::ListenerControl,
};
use core::time::Duration;
use futures::FutureExt;
use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

type Log = Arc<Mutex<Vec<u32>>>;

#[derive(Debug)]
struct TestConn {
    id: u32,
    closed: Log,
}

impl ConnectionHandle for TestConn {
    fn close(self) {
        self.closed.lock().unwrap().push(self.id);
    }
}

#[derive(Clone, Default)]
struct MockWorker {
    offers: Arc<Mutex<VecDeque<Offer<TestConn>>>>,
    unreachable: Arc<AtomicBool>,
    full: Arc<AtomicBool>,
}

impl MockWorker {
    fn take(&self) -> Option<Offer<TestConn>> {
        self.offers.lock().unwrap().pop_front()
    }

    fn outstanding(&self) -> usize {
        self.offers.lock().unwrap().len()
    }

    fn offered_id(&self) -> Option<u32> {
        self.offers.lock().unwrap().front().map(|offer| offer.handle().id)
    }
}

impl WorkerChannel<TestConn> for MockWorker {
    fn send(&self, offer: Offer<TestConn>) -> core::result::Result<(), SendError<TestConn>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SendError::Closed(offer));
        }
        if self.full.load(Ordering::SeqCst) {
            return Err(SendError::Full(offer));
        }
        self.offers.lock().unwrap().push_back(offer);
        Ok(())
    }
}

#[derive(Clone)]
struct MockListener {
    stopped: Arc<AtomicBool>,
    addr: Option<SocketAddr>,
}

impl ListenerControl for MockListener {
    fn local_address(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

type Readiness = Arc<Mutex<Vec<Result<Option<SocketAddr>>>>>;

struct Harness {
    router: Router<TestConn, MockWorker, MockListener>,
    stopped: Arc<AtomicBool>,
    closed: Log,
    addr: SocketAddr,
}

impl Harness {
    fn unbound() -> Self {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let listener = MockListener {
            stopped: Arc::clone(&stopped),
            addr: Some(addr),
        };
        Self {
            router: Router::new(listener),
            stopped,
            closed: Log::default(),
            addr,
        }
    }

    fn bound() -> Self {
        let mut harness = Self::unbound();
        harness.router.listening(Ok(()));
        harness
    }

    fn conn(&self, id: u32) -> TestConn {
        TestConn {
            id,
            closed: Arc::clone(&self.closed),
        }
    }

    fn distribute(&mut self, id: u32) {
        let conn = self.conn(id);
        self.router.distribute(conn);
    }

    fn register(&mut self, id: usize) -> (MockWorker, Readiness) {
        let worker = MockWorker::default();
        let readiness = Readiness::default();
        let log = Arc::clone(&readiness);
        self.router
            .register_worker(
                WorkerId(id),
                worker.clone(),
                Box::new(move |result| log.lock().unwrap().push(result)),
            )
            .unwrap();
        (worker, readiness)
    }

    /// Applies every reply that is already available.
    fn settle(&mut self) {
        while let Some(Some(completion)) = self.router.next_completion().now_or_never() {
            self.router.complete(completion);
        }
    }

    fn closed(&self) -> Vec<u32> {
        self.closed.lock().unwrap().clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

fn bind_error() -> crate::BindError {
    crate::BindError::new(
        "127.0.0.1:4000",
        &std::io::Error::from(std::io::ErrorKind::AddrInUse),
    )
}

#[test]
fn idle_selection_is_fifo() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);
    assert!(h.router.is_idle(WorkerId(1)));
    assert!(h.router.is_idle(WorkerId(2)));

    h.distribute(10);
    assert_eq!(a.offered_id(), Some(10));
    assert_eq!(b.outstanding(), 0);
    assert!(!h.router.is_idle(WorkerId(1)));
    assert!(h.router.is_idle(WorkerId(2)));
}

#[test]
fn idle_first_is_not_round_robin() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);

    // A takes the first connection while B sits idle.
    h.distribute(10);
    let first = a.take().unwrap().accept();
    h.settle();

    // A re-joined the idle queue behind B, so B is next.
    h.distribute(11);
    assert_eq!(b.offered_id(), Some(11));

    // B is still busy; A answers quickly and gets the next one as well.
    h.distribute(12);
    assert_eq!(a.offered_id(), Some(12));
    let second = a.take().unwrap().accept();
    h.settle();

    h.distribute(13);
    assert_eq!(a.offered_id(), Some(13));
    assert_eq!(b.outstanding(), 1);
    assert_eq!((first.id, second.id), (10, 12));
}

#[test]
fn rejected_handle_goes_to_idle_worker() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);

    h.distribute(10);
    a.take().unwrap().reject();
    h.settle();

    assert_eq!(b.offered_id(), Some(10));
    assert_eq!(a.outstanding(), 0);
    assert!(h.router.is_idle(WorkerId(1)));
    assert!(h.closed().is_empty());
    assert_eq!(h.router.stats().rejected, 1);
}

#[test]
fn rejected_handle_is_retried_on_the_rejecting_worker() {
    // Preserved behavior: with nobody idle, the rejecting worker is dispatched
    // again right away and may receive the very handle it just declined.
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);

    h.distribute(10);
    h.distribute(11);
    assert_eq!(b.offered_id(), Some(11));

    a.take().unwrap().reject();
    h.settle();

    assert_eq!(a.offered_id(), Some(10));
    assert_eq!(h.router.pending_len(), 0);
    assert!(h.closed().is_empty());
}

#[test]
fn rejected_handle_waits_for_next_idle_worker() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);

    h.distribute(10);
    h.distribute(11);
    h.distribute(12);
    assert_eq!(h.router.pending_len(), 1);

    // 10 goes to the tail behind 12; A is retried and takes the head.
    a.take().unwrap().reject();
    h.settle();
    assert_eq!(a.offered_id(), Some(12));
    assert_eq!(h.router.pending_len(), 1);

    // B frees up first and receives the rejected handle.
    let _held = b.take().unwrap().accept();
    h.settle();
    assert_eq!(b.offered_id(), Some(10));
    assert_eq!(h.router.pending_len(), 0);
    assert!(h.closed().is_empty());
}

#[test]
fn teardown_closes_queued_handles() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);

    h.distribute(10);
    h.distribute(11);
    h.distribute(12);
    assert_eq!(h.router.pending_len(), 2);

    assert!(h.router.unregister_worker(WorkerId(1)));
    assert_eq!(h.closed(), vec![11, 12]);
    assert!(h.is_stopped());
    assert_eq!(h.router.listener_state(), &ListenerState::Stopped);

    // The in-flight handoff is not rescinded and its reply still applies.
    let held = a.take().unwrap().accept();
    h.settle();
    assert_eq!(held.id, 10);
    assert_eq!(h.closed(), vec![11, 12]);

    let stats = h.router.stats();
    assert_eq!((stats.accepted, stats.closed, stats.registered), (1, 2, 0));
}

#[test]
fn unregister_with_survivors_keeps_queue() {
    let mut h = Harness::bound();
    let (_a, _) = h.register(1);
    let (_b, _) = h.register(2);

    h.distribute(10);
    h.distribute(11);
    h.distribute(12);

    assert!(!h.router.unregister_worker(WorkerId(1)));
    assert_eq!(h.router.pending_len(), 1);
    assert!(h.closed().is_empty());
    assert!(!h.is_stopped());
}

#[test]
fn rejection_after_teardown_closes_handle() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    h.distribute(10);

    assert!(h.router.unregister_worker(WorkerId(1)));
    a.take().unwrap().reject();
    h.settle();

    assert_eq!(h.closed(), vec![10]);
}

#[test]
fn late_joiner_receives_queued_connection() {
    let mut h = Harness::bound();
    h.distribute(10);
    assert_eq!(h.router.pending_len(), 1);

    let (a, ready) = h.register(1);
    assert_eq!(ready.lock().unwrap().len(), 1);
    assert_eq!(a.offered_id(), Some(10));
    assert_eq!(h.router.pending_len(), 0);
}

#[test]
fn unregister_is_idempotent() {
    let mut h = Harness::bound();
    let (_a, _) = h.register(1);
    let (_b, _) = h.register(2);
    h.distribute(10);
    h.distribute(11);
    h.distribute(12);

    assert!(!h.router.unregister_worker(WorkerId(1)));
    assert!(!h.router.unregister_worker(WorkerId(1)));
    assert!(h.router.unregister_worker(WorkerId(2)));
    assert_eq!(h.closed(), vec![12]);

    assert!(!h.router.unregister_worker(WorkerId(2)));
    assert_eq!(h.closed(), vec![12]);
    assert!(!h.router.unregister_worker(WorkerId(99)));
}

#[test]
fn readiness_is_deferred_until_bound() {
    let mut h = Harness::unbound();
    let (a, ready) = h.register(1);
    assert!(ready.lock().unwrap().is_empty());
    assert!(!h.router.is_idle(WorkerId(1)));

    h.router.listening(Ok(()));
    let ready = ready.lock().unwrap();
    assert!(matches!(ready.as_slice(), [Ok(Some(addr))] if *addr == h.addr));
    assert!(h.router.is_idle(WorkerId(1)));
    assert_eq!(a.outstanding(), 0);
}

#[test]
fn bind_failure_is_reported_without_dispatch() {
    let mut h = Harness::unbound();
    let (a, first) = h.register(1);
    let (_b, second) = h.register(2);

    h.router.listening(Err(bind_error()));
    for ready in [&first, &second] {
        let ready = ready.lock().unwrap();
        assert!(matches!(ready.as_slice(), [Err(Error::Bind(_))]));
    }
    assert!(h.router.is_registered(WorkerId(1)));
    assert!(!h.router.is_idle(WorkerId(1)));

    // A second notification is ignored.
    h.router.listening(Ok(()));
    assert_eq!(first.lock().unwrap().len(), 1);

    h.distribute(10);
    assert_eq!(a.outstanding(), 0);
    assert_eq!(h.router.pending_len(), 1);

    let (_c, late) = h.register(3);
    assert!(matches!(late.lock().unwrap().as_slice(), [Err(Error::Bind(_))]));
}

#[test]
fn worker_leaving_before_ready_is_not_notified() {
    let mut h = Harness::unbound();
    let (_a, first) = h.register(1);
    let (_b, second) = h.register(2);

    assert!(!h.router.unregister_worker(WorkerId(1)));
    h.router.listening(Ok(()));

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);
    assert!(!h.router.is_idle(WorkerId(1)));
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut h = Harness::bound();
    let (_a, _) = h.register(1);

    let called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&called);
    let result = h.router.register_worker(
        WorkerId(1),
        MockWorker::default(),
        Box::new(move |_| flag.store(true, Ordering::SeqCst)),
    );
    assert!(matches!(result, Err(Error::DuplicateWorker(WorkerId(1)))));
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn after_teardown_connections_are_closed_and_registration_fails() {
    let mut h = Harness::bound();
    let (_a, _) = h.register(1);
    assert!(h.router.unregister_worker(WorkerId(1)));

    h.distribute(10);
    assert_eq!(h.closed(), vec![10]);

    let (b, ready) = h.register(2);
    assert!(matches!(ready.lock().unwrap().as_slice(), [Err(Error::ListenerStopped)]));
    h.distribute(11);
    assert_eq!(b.outstanding(), 0);
    assert_eq!(h.closed(), vec![10, 11]);
}

#[test]
fn late_reply_from_departed_worker_is_redistributed() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);

    h.distribute(10);
    assert!(!h.router.unregister_worker(WorkerId(1)));

    a.take().unwrap().reject();
    h.settle();

    assert_eq!(b.offered_id(), Some(10));
    assert_eq!(a.outstanding(), 0);
    assert!(h.closed().is_empty());
}

#[test]
fn stale_reply_does_not_double_dispatch_reused_id() {
    let mut h = Harness::bound();
    let (old_a, _) = h.register(1);
    let (b, _) = h.register(2);

    h.distribute(10);
    assert!(!h.router.unregister_worker(WorkerId(1)));
    let (new_a, _) = h.register(1);

    h.distribute(11);
    h.distribute(12);
    h.distribute(13);
    assert_eq!(b.offered_id(), Some(11));
    assert_eq!(new_a.offered_id(), Some(12));
    assert_eq!(h.router.pending_len(), 1);

    // The reply belongs to the previous registration of id 1.
    let _held = old_a.take().unwrap().accept();
    h.settle();

    assert_eq!(new_a.outstanding(), 1);
    assert_eq!(h.router.pending_len(), 1);
}

#[test]
fn unreachable_worker_keeps_handle_queued() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    a.unreachable.store(true, Ordering::SeqCst);

    h.distribute(10);
    assert_eq!(h.router.pending_len(), 1);
    assert!(!h.router.is_idle(WorkerId(1)));

    let (b, _) = h.register(2);
    assert_eq!(b.offered_id(), Some(10));
    assert!(h.closed().is_empty());
}

#[test]
fn full_mailbox_keeps_worker_idle() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    a.full.store(true, Ordering::SeqCst);

    h.distribute(10);
    assert_eq!(h.router.pending_len(), 1);
    assert!(h.router.is_idle(WorkerId(1)));
    assert_eq!(a.outstanding(), 0);

    a.full.store(false, Ordering::SeqCst);
    h.distribute(11);
    assert_eq!(a.offered_id(), Some(10));
    assert_eq!(h.router.pending_len(), 1);
    assert!(!h.router.is_idle(WorkerId(1)));
    assert!(h.closed().is_empty());
}

#[test]
fn full_mailbox_passes_connection_to_next_idle() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);
    let (b, _) = h.register(2);
    a.full.store(true, Ordering::SeqCst);

    h.distribute(10);
    assert_eq!(b.offered_id(), Some(10));
    assert_eq!(h.router.pending_len(), 0);
    assert!(h.router.is_idle(WorkerId(1)));
}

#[test]
fn dropped_offer_counts_as_lost() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);

    h.distribute(10);
    drop(a.take());
    h.settle();

    let stats = h.router.stats();
    assert_eq!((stats.lost, stats.in_flight), (1, 0));
    assert!(h.router.is_idle(WorkerId(1)));
    assert_eq!(h.closed(), vec![10]);
}

#[test]
fn one_outstanding_offer_per_worker() {
    let mut h = Harness::bound();
    let (a, _) = h.register(1);

    for id in 0..5 {
        h.distribute(id);
    }
    assert_eq!(a.outstanding(), 1);
    assert_eq!(h.router.pending_len(), 4);

    for expected in 0..5 {
        assert_eq!(a.offered_id(), Some(expected));
        let _conn = a.take().unwrap().accept();
        h.settle();
        assert!(a.outstanding() <= 1);
    }
    assert!(h.router.is_idle(WorkerId(1)));
    assert_eq!(h.router.stats().accepted, 5);
}

#[test]
fn documented_scenario() {
    let mut h = Harness::unbound();
    let (w1, cb1) = h.register(1);
    assert!(cb1.lock().unwrap().is_empty());

    h.router.listening(Ok(()));
    assert_eq!(cb1.lock().unwrap().len(), 1);
    assert!(h.router.is_idle(WorkerId(1)));

    h.distribute(1);
    assert_eq!(w1.offered_id(), Some(1));
    let _h1 = w1.take().unwrap().accept();
    h.settle();
    assert!(h.router.is_idle(WorkerId(1)));

    h.distribute(2);
    h.distribute(3);
    assert_eq!(w1.offered_id(), Some(2));
    assert_eq!(h.router.pending_len(), 1);

    let (w2, cb2) = h.register(2);
    assert!(matches!(cb2.lock().unwrap().as_slice(), [Ok(Some(_))]));
    assert_eq!(w2.offered_id(), Some(3));
    assert_eq!(h.router.pending_len(), 0);
    assert!(h.closed().is_empty());
}

/// Tiny deterministic generator so the mixed-operation run is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 33) as usize) % bound
    }
}

#[test]
fn no_loss_no_duplication() {
    let mut h = Harness::bound();
    let mut rng = Lcg(0x5eed);
    let mut workers: Vec<(usize, MockWorker)> = Vec::new();
    let mut registered: HashSet<usize> = HashSet::new();
    let mut accepted: Vec<u32> = Vec::new();
    let mut next_worker = 0;
    let mut next_conn = 0;

    for _ in 0..4 {
        let (worker, _) = h.register(next_worker);
        registered.insert(next_worker);
        workers.push((next_worker, worker));
        next_worker += 1;
    }

    for _ in 0..2_000 {
        match rng.next(6) {
            0 | 1 => {
                h.distribute(next_conn);
                next_conn += 1;
            }
            2 => {
                let (_, worker) = &workers[rng.next(workers.len())];
                if let Some(offer) = worker.take() {
                    accepted.push(offer.accept().id);
                }
            }
            3 => {
                let (_, worker) = &workers[rng.next(workers.len())];
                if let Some(offer) = worker.take() {
                    offer.reject();
                }
            }
            4 if registered.len() > 1 => {
                let id = workers[rng.next(workers.len())].0;
                if registered.remove(&id) {
                    assert!(!h.router.unregister_worker(WorkerId(id)));
                }
            }
            _ => {
                let (worker, _) = h.register(next_worker);
                registered.insert(next_worker);
                workers.push((next_worker, worker));
                next_worker += 1;
            }
        }
        h.settle();

        for (_, worker) in &workers {
            assert!(worker.outstanding() <= 1);
        }
    }

    // Let every worker accept what it holds until the system is quiet.
    loop {
        let mut progressed = false;
        for (_, worker) in &workers {
            if let Some(offer) = worker.take() {
                accepted.push(offer.accept().id);
                progressed = true;
            }
        }
        h.settle();
        if !progressed {
            break;
        }
    }

    let mut remaining: Vec<usize> = registered.into_iter().collect();
    remaining.sort_unstable();
    let last = remaining.pop().unwrap();
    for id in remaining {
        assert!(!h.router.unregister_worker(WorkerId(id)));
    }
    assert!(h.router.unregister_worker(WorkerId(last)));

    let closed = h.closed();
    let mut seen: Vec<u32> = accepted.iter().chain(closed.iter()).copied().collect();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..next_conn).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn actor_routes_and_tears_down() {
    let stopped = Arc::new(AtomicBool::new(false));
    let listener = MockListener {
        stopped: Arc::clone(&stopped),
        addr: Some("127.0.0.1:4000".parse().unwrap()),
    };
    let closed = Log::default();
    let (router, task) = spawn_router(listener, 8);

    let (channel, mut offers) = local_channel::<TestConn>();
    let ready = router.register(WorkerId(1), channel).await.unwrap();
    router.listening(Ok(())).await.unwrap();
    assert!(ready.wait().await.unwrap().is_some());

    router
        .distribute(TestConn {
            id: 1,
            closed: Arc::clone(&closed),
        })
        .await
        .unwrap();
    let conn = tokio::time::timeout(Duration::from_secs(5), offers.recv())
        .await
        .unwrap()
        .unwrap()
        .accept();
    assert_eq!(conn.id, 1);

    // Keep the worker busy: the next offer stays in the mailbox unanswered.
    for id in 2..=4 {
        router
            .distribute(TestConn {
                id,
                closed: Arc::clone(&closed),
            })
            .await
            .unwrap();
    }
    let stats = loop {
        let stats = router.stats().await.unwrap();
        if stats.accepted == 1 && stats.pending == 2 {
            break stats;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(stats.in_flight, 1);

    assert!(router.unregister_worker(WorkerId(1)).await.unwrap());
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(*closed.lock().unwrap(), vec![3, 4]);
    assert!(!router.unregister_worker(WorkerId(1)).await.unwrap());

    drop(router);
    let final_stats = task.await.unwrap();
    assert_eq!(final_stats.closed, 2);

    // The router is gone: rejecting the stranded offer closes it locally.
    let offer = offers.recv().await.unwrap();
    assert_eq!(offer.handle().id, 2);
    offer.reject();
    assert_eq!(*closed.lock().unwrap(), vec![3, 4, 2]);
}

#[tokio::test]
async fn actor_rejects_duplicate_ids() {
    let listener = MockListener {
        stopped: Arc::default(),
        addr: None,
    };
    let (router, _task) = spawn_router::<TestConn, _, _>(listener, 8);

    let (first, _first_offers) = local_channel::<TestConn>();
    let (second, _second_offers) = local_channel::<TestConn>();
    router.register(WorkerId(7), first).await.unwrap();
    assert!(matches!(
        router.register(WorkerId(7), second).await,
        Err(Error::DuplicateWorker(WorkerId(7)))
    ));
}

#[tokio::test]
async fn distribute_after_shutdown_closes_handle() {
    let listener = MockListener {
        stopped: Arc::default(),
        addr: None,
    };
    let (router, task) =
        spawn_router::<TestConn, crate::LocalWorkerChannel<TestConn>, _>(listener, 8);
    let spare = router.clone();
    drop(router);
    task.abort();
    let _ = task.await;

    let closed = Log::default();
    let result = spare
        .distribute(TestConn {
            id: 9,
            closed: Arc::clone(&closed),
        })
        .await;
    assert!(matches!(result, Err(Error::RouterShutdown)));
    assert_eq!(*closed.lock().unwrap(), vec![9]);
}
