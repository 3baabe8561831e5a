//! Websocket fan-out of snapshot sets to every connected client.
//!
//! Each client gets its own task and a small outbound queue. A broadcast
//! never waits on a client: it offers the serialized tick to every queue and
//! moves on, so a stalled peer only misses its own ticks.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::BroadcastError;
use crate::models::domain::FlowSnapshot;
use crate::models::dto::encode_snapshots;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8181";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    /// `Closed` is terminal and nothing moves back to `Connecting`.
    pub fn advance(self, next: SessionState) -> SessionState {
        match (self, next) {
            (SessionState::Closed, _) => SessionState::Closed,
            (_, SessionState::Closed) => SessionState::Closed,
            (SessionState::Connecting, SessionState::Open) => SessionState::Open,
            (current, _) => current,
        }
    }
}

/// Outcome of offering one payload to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; this tick is dropped for the session.
    Skipped,
    Closed,
}

#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    peer: SocketAddr,
    state: Mutex<SessionState>,
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
}

impl ClientSession {
    fn new(id: SessionId, peer: SocketAddr, outbound: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(SessionState::Connecting),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn transition(&self, next: SessionState) -> SessionState {
        let mut state = lock(&self.state);
        *state = state.advance(next);
        *state
    }

    /// Moves to `Closed` and releases the outbound queue, which tells the
    /// connection task to send a close frame and finish. Returns `false` if
    /// the session was already closed.
    pub fn close(&self) -> bool {
        let was_open = {
            let mut state = lock(&self.state);
            let was_open = *state != SessionState::Closed;
            *state = state.advance(SessionState::Closed);
            was_open
        };
        lock(&self.outbound).take();
        was_open
    }

    pub fn offer(&self, payload: Arc<str>) -> Delivery {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Delivery::Closed;
        };
        match tx.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Skipped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    /// Creates an `Open` session around `outbound` and tracks it.
    pub fn register(&self, peer: SocketAddr, outbound: mpsc::Sender<Arc<str>>) -> Arc<ClientSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ClientSession::new(id, peer, outbound));
        session.transition(SessionState::Open);
        lock(&self.sessions).insert(id, Arc::clone(&session));
        session
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        lock(&self.sessions).remove(&id)
    }

    /// Point-in-time copy of the live sessions, one entry per session.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<ClientSession>> {
        lock(&self.sessions).drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub removed: usize,
}

pub struct BroadcastServer {
    registry: SessionRegistry,
    session_buffer: usize,
}

/// Binds the websocket endpoint.
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, BroadcastError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| BroadcastError::Bind { addr, source })
}

impl BroadcastServer {
    /// `session_buffer` is how many ticks may wait for a slow client before
    /// further ticks are skipped for it.
    pub fn new(session_buffer: usize) -> Self {
        Self {
            registry: SessionRegistry::default(),
            session_buffer: session_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Serializes `snapshots` once and offers it to every live session.
    pub fn broadcast(&self, snapshots: &[FlowSnapshot]) -> Result<BroadcastReport, BroadcastError> {
        let payload: Arc<str> = Arc::from(encode_snapshots(snapshots)?);
        Ok(self.broadcast_payload(payload))
    }

    pub fn broadcast_payload(&self, payload: Arc<str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for session in self.registry.snapshot() {
            match session.offer(Arc::clone(&payload)) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Skipped => {
                    debug!(session = session.id(), "client lagging, tick skipped");
                    report.skipped += 1;
                }
                Delivery::Closed => {
                    session.close();
                    if self.registry.remove(session.id()).is_some() {
                        report.removed += 1;
                    }
                }
            }
        }
        report
    }

    /// Closes every session. Returns how many were open.
    pub fn close_all(&self) -> usize {
        self.registry
            .drain()
            .into_iter()
            .filter(|session| session.close())
            .count()
    }

    /// Accepts clients until `stop` flips to `true`, then closes whatever is
    /// still connected and waits briefly for close frames to go out.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "websocket server running");
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(Arc::clone(&self).handle_connection(stream, peer));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        let closed = self.close_all();
        debug!(closed, "accept loop stopped");
        let wait_all = async { while connections.join_next().await.is_some() {} };
        if time::timeout(DRAIN_TIMEOUT, wait_all).await.is_err() {
            connections.abort_all();
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match time::timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!(%peer, "websocket handshake failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(%peer, "websocket handshake timed out");
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Arc<str>>(self.session_buffer);
        let session = self.registry.register(peer, tx);
        info!(session = session.id(), %peer, "client connected");

        let (mut sink, mut inbound) = ws.split();
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(payload) => {
                        let send = sink.send(Message::Text(payload.to_string()));
                        match time::timeout(SEND_TIMEOUT, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(session = session.id(), "send failed: {}", e);
                                break;
                            }
                            Err(_) => {
                                debug!(session = session.id(), "send timed out");
                                break;
                            }
                        }
                    }
                    None => {
                        let _ = time::timeout(SEND_TIMEOUT, sink.send(Message::Close(None))).await;
                        break;
                    }
                },
                message = inbound.next() => match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = session.id(), "read failed: {}", e);
                        break;
                    }
                },
            }
        }

        session.close();
        self.registry.remove(session.id());
        info!(session = session.id(), %peer, "client disconnected");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain::Severity;
    use chrono::Local;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn closed_is_terminal() {
        use SessionState::*;
        assert_eq!(Connecting.advance(Open), Open);
        assert_eq!(Open.advance(Closed), Closed);
        assert_eq!(Connecting.advance(Closed), Closed);
        assert_eq!(Closed.advance(Open), Closed);
        assert_eq!(Closed.advance(Connecting), Closed);
        assert_eq!(Open.advance(Connecting), Open);
    }

    #[test]
    fn registered_sessions_are_open_and_unique() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::channel(1);
        let a = registry.register(peer(), tx.clone());
        let b = registry.register(peer(), tx);

        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), SessionState::Open);
        assert_eq!(registry.len(), 2);

        registry.remove(a.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].id(), b.id());
    }

    #[test]
    fn broadcast_without_sessions_sends_nothing() {
        let server = BroadcastServer::new(1);
        let report = server.broadcast(&[]).unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn each_session_gets_the_payload_once() {
        let server = BroadcastServer::new(4);
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        server.registry().register(peer(), tx1);
        server.registry().register(peer(), tx2);

        let snapshot = FlowSnapshot {
            source: "A".into(),
            destination: "B".into(),
            speed_kbps: 0.5,
            severity: Severity::Medium,
            captured_at: Local::now(),
        };
        let report = server.broadcast(&[snapshot]).unwrap();
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx1, &mut rx2] {
            let payload = rx.try_recv().unwrap();
            assert!(payload.contains("\"SourceIP\":\"A\""));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dead_session_is_removed_and_others_still_served() {
        let server = BroadcastServer::new(1);
        let (dead_tx, dead_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(1);
        let dead = server.registry().register(peer(), dead_tx);
        server.registry().register(peer(), live_tx);
        drop(dead_rx);

        let report = server.broadcast_payload(Arc::from("[]"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(dead.state(), SessionState::Closed);
        assert_eq!(server.session_count(), 1);
        assert_eq!(&*live_rx.try_recv().unwrap(), "[]");
    }

    #[test]
    fn lagging_session_skips_ticks_but_stays() {
        let server = BroadcastServer::new(1);
        let (tx, mut rx) = mpsc::channel(1);
        server.registry().register(peer(), tx);

        assert_eq!(server.broadcast_payload(Arc::from("1")).delivered, 1);
        let second = server.broadcast_payload(Arc::from("2"));
        assert_eq!(second.skipped, 1);
        assert_eq!(server.session_count(), 1);
        assert_eq!(&*rx.try_recv().unwrap(), "1");
    }

    #[test]
    fn concurrent_closers_report_one_transition() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::channel(1);
        let session = registry.register(peer(), tx);

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    session.close()
                })
            })
            .collect();
        let closed_by = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|closed| *closed)
            .count();

        assert_eq!(closed_by, 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn close_all_empties_the_registry_and_releases_queues() {
        let server = BroadcastServer::new(1);
        let (tx, mut rx) = mpsc::channel(1);
        let session = server.registry().register(peer(), tx);

        assert_eq!(server.close_all(), 1);
        assert!(server.registry().is_empty());
        assert_eq!(session.offer(Arc::from("late")), Delivery::Closed);
        assert!(!session.close());
        assert!(rx.try_recv().is_err());
        assert!(rx.blocking_recv().is_none());
    }
}
