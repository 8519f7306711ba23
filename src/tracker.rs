//! Upstream socket bookkeeping for one client connection.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinSet};

use crate::router::RouteTarget;
use crate::transport::{BoxedStream, Connector};

/// Identifies one opened upstream socket.
pub type StreamId = u64;

pub type ConnectResult = (RouteTarget, StreamId, io::Result<BoxedStream>);

#[derive(Debug)]
pub enum TrackerEvent {
    /// The in-use target is connected. Emitted once per `connect` call.
    Live { target: RouteTarget, id: StreamId },
    Closed { target: RouteTarget },
    Error { target: RouteTarget, error: io::Error },
}

enum Slot {
    Connecting { id: StreamId, waiters: usize },
    Live { id: StreamId, stream: BoxedStream },
}

/// Owns every upstream socket a client connection opened, at most one per
/// target. Only the target named by the latest `connect` call is in use, and
/// only its closure or failure is reported, once.
pub struct ConnectionTracker {
    connector: Arc<dyn Connector>,
    slots: HashMap<RouteTarget, Slot>,
    in_use: Option<RouteTarget>,
    connecting: JoinSet<ConnectResult>,
    ready: VecDeque<TrackerEvent>,
    next_id: StreamId,
    terminated: bool,
}

impl ConnectionTracker {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: HashMap::new(),
            in_use: None,
            connecting: JoinSet::new(),
            ready: VecDeque::new(),
            next_id: 0,
            terminated: false,
        }
    }

    pub fn in_use(&self) -> Option<&RouteTarget> {
        self.in_use.as_ref()
    }

    /// Number of tracked sockets, connecting or live.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Marks `target` in use. A live socket for it is reported right away
    /// through `next_ready`; otherwise one connect is started and shared by
    /// every caller until it finishes.
    pub fn connect(&mut self, target: RouteTarget) {
        self.in_use = Some(target.clone());
        self.terminated = false;
        match self.slots.get_mut(&target) {
            Some(Slot::Live { id, .. }) => {
                trace!("reusing upstream {} ({})", target, id);
                let id = *id;
                self.ready.push_back(TrackerEvent::Live { target, id });
            }
            Some(Slot::Connecting { waiters, .. }) => *waiters += 1,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                debug!("opening upstream {} ({})", target, id);
                let fut = self.connector.connect(&target);
                let key = target.clone();
                self.connecting.spawn(async move { (key, id, fut.await) });
                self.slots.insert(target, Slot::Connecting { id, waiters: 1 });
            }
        }
    }

    /// Events that are ready without waiting on a connect.
    pub fn next_ready(&mut self) -> Option<TrackerEvent> {
        self.ready.pop_front()
    }

    pub fn is_connecting(&self) -> bool {
        !self.connecting.is_empty()
    }

    /// The live in-use stream plus the pending connects, borrowed apart so
    /// both can be awaited together.
    pub fn io_parts(&mut self) -> (Option<&mut BoxedStream>, &mut JoinSet<ConnectResult>) {
        let active = match &self.in_use {
            Some(target) => match self.slots.get_mut(target) {
                Some(Slot::Live { stream, .. }) => Some(stream),
                _ => None,
            },
            None => None,
        };
        (active, &mut self.connecting)
    }

    pub fn active_mut(&mut self) -> Option<&mut BoxedStream> {
        self.io_parts().0
    }

    pub fn on_connect_result(&mut self, res: Result<ConnectResult, JoinError>) {
        let (target, id, result) = match res {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!("upstream connect task failed: {}", e);
                return;
            }
        };
        let waiters = match self.slots.get(&target) {
            Some(Slot::Connecting { id: slot_id, waiters }) if *slot_id == id => *waiters,
            // abandoned while connecting
            _ => return,
        };
        match result {
            Ok(stream) => {
                self.slots.insert(target.clone(), Slot::Live { id, stream });
                if self.in_use.as_ref() == Some(&target) {
                    for _ in 0..waiters {
                        self.ready.push_back(TrackerEvent::Live {
                            target: target.clone(),
                            id,
                        });
                    }
                } else {
                    debug!("upstream {} connected after being replaced", target);
                }
            }
            Err(error) => {
                self.slots.remove(&target);
                self.fail(target, error);
            }
        }
    }

    /// Records that `target`'s socket closed. Returns true when the closure
    /// was queued for the owner, which only happens for the in-use target.
    pub fn stream_closed(&mut self, target: &RouteTarget) -> bool {
        self.slots.remove(target);
        if !self.is_terminal(target) {
            return false;
        }
        self.terminated = true;
        self.destroy();
        self.ready.push_back(TrackerEvent::Closed { target: target.clone() });
        true
    }

    /// Records that `target`'s socket failed.
    pub fn stream_failed(&mut self, target: &RouteTarget, error: io::Error) -> bool {
        self.slots.remove(target);
        self.fail(target.clone(), error)
    }

    fn fail(&mut self, target: RouteTarget, error: io::Error) -> bool {
        if !self.is_terminal(&target) {
            debug!("dropping failed upstream {}: {}", target, error);
            return false;
        }
        self.terminated = true;
        self.destroy();
        self.ready.push_back(TrackerEvent::Error { target, error });
        true
    }

    fn is_terminal(&self, target: &RouteTarget) -> bool {
        !self.terminated && self.in_use.as_ref() == Some(target)
    }

    /// Gracefully closes the in-use socket and reports it like any other
    /// closure.
    pub async fn close_in_use(&mut self) -> bool {
        let target = match self.in_use.clone() {
            Some(t) => t,
            None => return false,
        };
        if let Some(Slot::Live { mut stream, .. }) = self.slots.remove(&target) {
            let _ = stream.shutdown().await;
        }
        self.stream_closed(&target)
    }

    /// Drops the in-use socket without notifying anyone. Used when the
    /// exchange moves to another upstream.
    pub fn abandon_in_use(&mut self) {
        if let Some(target) = self.in_use.take() {
            if self.slots.remove(&target).is_some() {
                debug!("abandoned upstream {}", target);
            }
        }
    }

    /// Closes every tracked socket and cancels pending connects. Idempotent.
    pub fn destroy(&mut self) {
        if !self.slots.is_empty() {
            trace!("closing {} upstream socket(s)", self.slots.len());
        }
        self.slots.clear();
        self.connecting.abort_all();
        self.ready.retain(|e| !matches!(e, TrackerEvent::Live { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct FakeConnector {
        opened: AtomicUsize,
        peers: Mutex<Vec<DuplexStream>>,
        refuse: bool,
    }

    impl Connector for FakeConnector {
        fn connect(&self, _target: &RouteTarget) -> ConnectFuture {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Box::pin(async {
                    Err::<BoxedStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
                });
            }
            let (ours, theirs) = tokio::io::duplex(64);
            self.peers.lock().unwrap().push(theirs);
            Box::pin(async move {
                tokio::task::yield_now().await;
                Ok(Box::new(ours) as BoxedStream)
            })
        }
    }

    fn target(port: u16) -> RouteTarget {
        RouteTarget::http("origin", port)
    }

    async fn next_event(tracker: &mut ConnectionTracker) -> Option<TrackerEvent> {
        if let Some(event) = tracker.next_ready() {
            return Some(event);
        }
        while let Some(res) = tracker.connecting.join_next().await {
            tracker.on_connect_result(res);
            if let Some(event) = tracker.next_ready() {
                return Some(event);
            }
        }
        None
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_socket() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());

        tracker.connect(target(1));
        tracker.connect(target(1));
        assert!(tracker.next_ready().is_none());

        let first = next_event(&mut tracker).await.unwrap();
        let second = next_event(&mut tracker).await.unwrap();
        let ids: Vec<_> = [first, second]
            .into_iter()
            .map(|e| match e {
                TrackerEvent::Live { id, .. } => id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![0, 0]);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert!(tracker.active_mut().is_some());
    }

    #[tokio::test]
    async fn live_socket_is_reused_immediately() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());
        tracker.connect(target(1));
        next_event(&mut tracker).await.unwrap();

        tracker.connect(target(1));
        assert!(matches!(tracker.next_ready(), Some(TrackerEvent::Live { id: 0, .. })));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn only_in_use_target_reports_closure_once() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());
        tracker.connect(target(1));
        next_event(&mut tracker).await.unwrap();
        tracker.connect(target(2));
        next_event(&mut tracker).await.unwrap();
        assert_eq!(tracker.len(), 2);

        // target 1 lingers; its closure is silent
        assert!(!tracker.stream_closed(&target(1)));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.next_ready().is_none());

        assert!(tracker.stream_closed(&target(2)));
        let err = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(!tracker.stream_failed(&target(2), err));
        assert!(matches!(tracker.next_ready(), Some(TrackerEvent::Closed { .. })));
        assert!(tracker.next_ready().is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn failure_of_in_use_target_destroys_the_rest() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());
        tracker.connect(target(1));
        next_event(&mut tracker).await.unwrap();
        tracker.connect(target(2));
        next_event(&mut tracker).await.unwrap();

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(tracker.stream_failed(&target(2), err));
        assert!(tracker.is_empty());
        assert!(matches!(tracker.next_ready(), Some(TrackerEvent::Error { .. })));
        tracker.destroy();
    }

    #[tokio::test]
    async fn refused_connect_is_reported() {
        let connector = Arc::new(FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        });
        let mut tracker = ConnectionTracker::new(connector);
        tracker.connect(target(1));
        match next_event(&mut tracker).await {
            Some(TrackerEvent::Error { error, .. }) => {
                assert_eq!(error.kind(), io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn abandoned_connect_is_silent() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());
        tracker.connect(target(1));
        tracker.abandon_in_use();
        tracker.connect(target(2));
        let event = next_event(&mut tracker).await.unwrap();
        assert!(matches!(event, TrackerEvent::Live { ref target, .. } if target.port == 2));
        assert!(next_event(&mut tracker).await.is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn close_in_use_reports_closed() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector);
        tracker.connect(target(1));
        next_event(&mut tracker).await.unwrap();
        assert!(tracker.close_in_use().await);
        assert!(!tracker.close_in_use().await);
        assert!(matches!(next_event(&mut tracker).await, Some(TrackerEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn abandoned_live_socket_is_replaced_on_next_connect() {
        let connector = Arc::new(FakeConnector::default());
        let mut tracker = ConnectionTracker::new(connector.clone());

        tracker.connect(target(1));
        assert!(matches!(next_event(&mut tracker).await, Some(TrackerEvent::Live { id: 0, .. })));
        tracker.abandon_in_use();
        assert!(tracker.is_empty());
        assert!(tracker.next_ready().is_none());

        tracker.connect(target(1));
        assert!(matches!(next_event(&mut tracker).await, Some(TrackerEvent::Live { id: 1, .. })));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }
}
