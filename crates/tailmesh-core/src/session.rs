//! Per-peer sessions.
//!
//! Each known peer gets one worker that owns its path state:
//!
//! ```text
//!   Unknown ──► Negotiating ──► DirectEstablished ─┐
//!                   ▲   │                          │ path_timeout
//!                   │   └────► RelayEstablished ───┤ PeerGone
//!                   └──────────────────────────────┘ relay lost
//! ```
//!
//! Negotiation pings every candidate endpoint and the relay region chosen
//! for the peer in the same round; the first pong establishes the path.
//! Once relayed, a direct endpoint must answer `direct_promote_pongs` pings
//! in a row before traffic moves to it. Descriptor updates, pongs and relay
//! notices all arrive on one event channel, so they are applied in order.

use crate::config::EngineTimings;
use crate::magicsock::{Magicsock, Message};
use crate::Node;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tailmesh_crypto::{NodeKey, PeerCipher};
use tailmesh_relay::RegionId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Direct endpoints pinged per negotiation round.
pub const MAX_PROBES_PER_ROUND: usize = 8;

/// Addresses a peer pinged us from that are kept as extra candidates.
const MAX_LEARNED_ENDPOINTS: usize = 4;

/// How packets reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// UDP straight to the peer's endpoint
    Direct(SocketAddr),
    /// Through a relay region
    Relay(RegionId),
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct(addr) => write!(f, "direct {addr}"),
            PathKind::Relay(region) => write!(f, "relay region {region}"),
        }
    }
}

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, worker not yet running
    Unknown,
    /// Probing for a path
    Negotiating,
    /// Packets go directly over UDP
    DirectEstablished,
    /// Packets go through a relay
    RelayEstablished,
    /// Peer removed or engine closed
    Closed,
}

impl SessionState {
    /// Whether a path is usable.
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::DirectEstablished | Self::RelayEstablished)
    }
}

/// Snapshot of a peer session.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    /// Peer identity
    pub key: NodeKey,
    /// Current state
    pub state: SessionState,
    /// Current path, if established
    pub path: Option<PathKind>,
    /// When the current path last answered a ping
    pub last_confirmed: Option<Instant>,
    /// Round trip of the last answered ping on the current path
    pub latency: Option<Duration>,
    /// Last descriptor applied to the session
    pub node: Node,
}

impl PeerStatus {
    fn new(node: Node) -> Self {
        Self {
            key: node.key,
            state: SessionState::Unknown,
            path: None,
            last_confirmed: None,
            latency: None,
            node,
        }
    }

    /// Established, with a confirmation at or after `since`.
    #[must_use]
    pub fn confirmed_since(&self, since: Instant) -> bool {
        self.state.is_established() && self.last_confirmed.is_some_and(|t| t >= since)
    }
}

/// Inputs to a session worker.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Directory applied a new descriptor
    NodeUpdated(Node),
    /// Our ping was answered
    Pong { tx_id: u64 },
    /// The peer pinged us
    PingReceived { path: PathKind },
    /// A relay reported the peer is not connected there
    PeerGone { region: RegionId },
    /// Probe right away
    ProbeNow,
    /// Measure the current path
    Ping(oneshot::Sender<(Duration, PathKind)>),
}

/// What sessions share with the rest of the engine.
pub(crate) struct SessionContext {
    pub(crate) sock: Arc<Magicsock>,
    pub(crate) timings: EngineTimings,
    pub(crate) block_endpoints: bool,
}

/// Engine-side handle to a session worker.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<PeerStatus>,
    cipher: Arc<PeerCipher>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn spawn(
        ctx: Arc<SessionContext>,
        node: Node,
        cipher: Arc<PeerCipher>,
        tracker: &TaskTracker,
        parent: &CancellationToken,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PeerStatus::new(node.clone()));
        let cancel = parent.child_token();
        let session = Session::new(ctx, node, cipher.clone(), status_tx);
        tracker.spawn(session.run(rx, cancel.clone()).in_current_span());
        Self {
            events,
            status,
            cipher,
            cancel,
        }
    }

    /// Queue an event; false if the worker is gone.
    pub(crate) fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub(crate) fn cipher(&self) -> &PeerCipher {
        &self.cipher
    }

    pub(crate) fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn path(&self) -> Option<PathKind> {
        self.status.borrow().path
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status.clone()
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

struct Probe {
    path: PathKind,
    sent: Instant,
    reply: Option<oneshot::Sender<(Duration, PathKind)>>,
}

struct Session {
    ctx: Arc<SessionContext>,
    key: NodeKey,
    node: Node,
    cipher: Arc<PeerCipher>,
    state: SessionState,
    path: Option<PathKind>,
    last_confirmed: Option<Instant>,
    latency: Option<Duration>,
    pending: HashMap<u64, Probe>,
    /// Consecutive direct pongs while relayed
    streak: Option<(SocketAddr, u32)>,
    learned: Vec<SocketAddr>,
    last_probe: Option<Instant>,
    status: watch::Sender<PeerStatus>,
}

impl Session {
    fn new(
        ctx: Arc<SessionContext>,
        node: Node,
        cipher: Arc<PeerCipher>,
        status: watch::Sender<PeerStatus>,
    ) -> Self {
        Self {
            ctx,
            key: node.key,
            node,
            cipher,
            state: SessionState::Unknown,
            path: None,
            last_confirmed: None,
            latency: None,
            pending: HashMap::new(),
            streak: None,
            learned: Vec::new(),
            last_probe: None,
            status,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>, cancel: CancellationToken) {
        let mut routes = self.ctx.sock.pool().subscribe_routes();
        self.state = SessionState::Negotiating;
        self.publish();
        tracing::debug!(peer = %self.key.short(), "session started");

        let mut next_probe = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle(event) {
                            next_probe = Instant::now();
                        }
                    }
                    None => break,
                },
                res = routes.changed() => {
                    if res.is_err() {
                        break;
                    }
                    if self.on_routes_changed() {
                        next_probe = Instant::now();
                    }
                }
                _ = tokio::time::sleep_until(next_probe.into()) => {
                    let now = Instant::now();
                    self.expire(now);
                    self.probe(now);
                    next_probe = now + self.interval();
                }
            }
        }

        self.path = None;
        self.state = SessionState::Closed;
        self.publish();
        tracing::debug!(peer = %self.key.short(), "session closed");
    }

    fn interval(&self) -> Duration {
        if self.state.is_established() {
            self.ctx.timings.heartbeat_interval
        } else {
            self.ctx.timings.negotiate_interval
        }
    }

    /// Apply an event; true if a probe round should run now.
    fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::NodeUpdated(node) => {
                self.node = node;
                self.publish();
                !self.state.is_established()
            }
            SessionEvent::Pong { tx_id } => {
                self.on_pong(tx_id, Instant::now());
                false
            }
            SessionEvent::PingReceived { path } => self.on_ping_received(path),
            SessionEvent::PeerGone { region } => {
                if self.path == Some(PathKind::Relay(region)) {
                    self.drop_path("peer gone from relay");
                    return true;
                }
                false
            }
            SessionEvent::ProbeNow => true,
            SessionEvent::Ping(reply) => {
                if let Some(path) = self.path {
                    self.send_ping(path, Some(reply));
                }
                false
            }
        }
    }

    fn on_ping_received(&mut self, path: PathKind) -> bool {
        if let PathKind::Direct(addr) = path {
            let known = self.node.endpoints.iter().any(|e| e.addr == addr) || self.learned.contains(&addr);
            if !self.ctx.block_endpoints && !known {
                if self.learned.len() == MAX_LEARNED_ENDPOINTS {
                    self.learned.remove(0);
                }
                self.learned.push(addr);
            }
        }
        let min_gap = self.ctx.timings.negotiate_interval / 2;
        !self.state.is_established() && self.last_probe.is_none_or(|t| t.elapsed() >= min_gap)
    }

    fn on_routes_changed(&mut self) -> bool {
        if let Some(PathKind::Relay(region)) = self.path {
            if !self.ctx.sock.pool().is_healthy(region) {
                self.drop_path("relay region unavailable");
                return true;
            }
        }
        !self.state.is_established()
    }

    fn on_pong(&mut self, tx_id: u64, now: Instant) {
        let Some(probe) = self.pending.remove(&tx_id) else {
            tracing::debug!(peer = %self.key.short(), tx_id, "pong for unknown ping");
            return;
        };
        let rtt = now.saturating_duration_since(probe.sent);
        if let Some(reply) = probe.reply {
            let _ = reply.send((rtt, probe.path));
        }

        match (self.path, probe.path) {
            (None, path) => self.establish(path, now, rtt),
            (Some(current), path) if current == path => {
                self.last_confirmed = Some(now);
                self.latency = Some(rtt);
                self.publish();
            }
            (Some(PathKind::Relay(_)), PathKind::Direct(addr)) => {
                let count = match self.streak {
                    Some((a, n)) if a == addr => n + 1,
                    _ => 1,
                };
                self.streak = Some((addr, count));
                if count >= self.ctx.timings.direct_promote_pongs {
                    self.establish(PathKind::Direct(addr), now, rtt);
                }
            }
            (Some(PathKind::Relay(_)), PathKind::Relay(region)) => {
                if self.ctx.sock.pool().route_for(&self.node) == Some(region) {
                    self.establish(PathKind::Relay(region), now, rtt);
                }
            }
            (Some(PathKind::Direct(_)), _) => {}
        }
    }

    fn establish(&mut self, path: PathKind, now: Instant, rtt: Duration) {
        let previous = self.path.replace(path);
        self.state = match path {
            PathKind::Direct(_) => SessionState::DirectEstablished,
            PathKind::Relay(_) => SessionState::RelayEstablished,
        };
        self.streak = None;
        self.last_confirmed = Some(now);
        self.latency = Some(rtt);
        match previous {
            Some(previous) => {
                tracing::info!(peer = %self.key.short(), from = %previous, to = %path, ?rtt, "path switched")
            }
            None => tracing::info!(peer = %self.key.short(), %path, ?rtt, "path established"),
        }
        self.publish();
    }

    fn drop_path(&mut self, reason: &str) {
        if let Some(path) = self.path.take() {
            tracing::info!(peer = %self.key.short(), %path, reason, "path lost");
            self.state = SessionState::Negotiating;
            self.streak = None;
            self.publish();
        }
    }

    /// Forget unanswered pings and drop a path that stopped answering.
    fn expire(&mut self, now: Instant) {
        let timeout = self.ctx.timings.path_timeout;
        let mut streak_lost = false;
        let streak = self.streak.map(|(addr, _)| PathKind::Direct(addr));
        self.pending.retain(|_, probe| {
            let live = now.saturating_duration_since(probe.sent) < timeout;
            if !live && Some(probe.path) == streak {
                streak_lost = true;
            }
            live
        });
        if streak_lost {
            self.streak = None;
        }

        let stale = self
            .last_confirmed
            .is_none_or(|t| now.saturating_duration_since(t) > timeout);
        if self.state.is_established() && stale {
            self.drop_path("no pong within path timeout");
        }
    }

    fn probe(&mut self, now: Instant) {
        self.last_probe = Some(now);
        let mut targets = Vec::new();
        match self.path {
            Some(PathKind::Direct(addr)) => targets.push(PathKind::Direct(addr)),
            _ => {
                if !self.ctx.block_endpoints {
                    let candidates = self
                        .node
                        .endpoints
                        .iter()
                        .map(|e| e.addr)
                        .chain(self.learned.iter().copied());
                    for addr in candidates {
                        let path = PathKind::Direct(addr);
                        if !targets.contains(&path) {
                            targets.push(path);
                        }
                        if targets.len() == MAX_PROBES_PER_ROUND {
                            break;
                        }
                    }
                }
                if let Some(region) = self.ctx.sock.pool().route_for(&self.node) {
                    targets.push(PathKind::Relay(region));
                }
            }
        }
        for path in targets {
            self.send_ping(path, None);
        }
    }

    fn send_ping(&mut self, path: PathKind, reply: Option<oneshot::Sender<(Duration, PathKind)>>) {
        let tx_id = rand::random::<u64>();
        match self.ctx.sock.send(&self.cipher, &path, &Message::Ping { tx_id }) {
            Ok(()) => {
                self.pending.insert(
                    tx_id,
                    Probe {
                        path,
                        sent: Instant::now(),
                        reply,
                    },
                );
            }
            Err(e) => tracing::debug!(peer = %self.key.short(), %path, "ping not sent: {e}"),
        }
    }

    fn publish(&self) {
        self.status.send_replace(PeerStatus {
            key: self.key,
            state: self.state,
            path: self.path,
            last_confirmed: self.last_confirmed,
            latency: self.latency,
            node: self.node.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::LocalNode;
    use crate::relay_pool::RelayPool;
    use crate::{Endpoint, EndpointSource, OverlayPrefix};
    use tailmesh_crypto::NodePrivate;

    struct Fixture {
        session: Session,
        status: watch::Receiver<PeerStatus>,
        _tracker: TaskTracker,
        _cancel: CancellationToken,
    }

    async fn fixture(block_endpoints: bool, endpoints: &[u16]) -> Fixture {
        let local = NodePrivate::generate();
        let peer = NodePrivate::generate();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let local_node = Arc::new(LocalNode::new(
            local.public_key(),
            vec![OverlayPrefix::random()],
            true,
        ));
        let (inbound, _) = mpsc::channel(8);
        let pool = RelayPool::new(
            local.clone(),
            local_node,
            inbound,
            EngineTimings::default(),
            tracker.clone(),
            cancel.clone(),
        );
        let sock = Arc::new(Magicsock::bind(local.public_key(), 0, pool).unwrap());
        let ctx = Arc::new(SessionContext {
            sock,
            timings: EngineTimings::default(),
            block_endpoints,
        });

        let mut node = Node::new(peer.public_key());
        node.addresses = vec![OverlayPrefix::random()];
        node.endpoints = endpoints
            .iter()
            .map(|p| Endpoint::new(([127, 0, 0, 1], *p).into(), EndpointSource::Local))
            .collect();
        let cipher = Arc::new(PeerCipher::new(&local, &peer.public_key()).unwrap());
        let (tx, status) = watch::channel(PeerStatus::new(node.clone()));
        let mut session = Session::new(ctx, node, cipher, tx);
        session.state = SessionState::Negotiating;
        Fixture {
            session,
            status,
            _tracker: tracker,
            _cancel: cancel,
        }
    }

    fn pending_for(session: &Session, path: PathKind) -> Vec<u64> {
        session
            .pending
            .iter()
            .filter(|(_, p)| p.path == path)
            .map(|(id, _)| *id)
            .collect()
    }

    fn direct(port: u16) -> PathKind {
        PathKind::Direct(([127, 0, 0, 1], port).into())
    }

    #[tokio::test]
    async fn test_first_pong_establishes() {
        let mut f = fixture(false, &[40001, 40002]).await;
        f.session.probe(Instant::now());
        assert_eq!(f.session.pending.len(), 2);

        let tx = pending_for(&f.session, direct(40002))[0];
        f.session.on_pong(tx, Instant::now());
        let status = f.status.borrow().clone();
        assert_eq!(status.state, SessionState::DirectEstablished);
        assert_eq!(status.path, Some(direct(40002)));
        assert!(status.last_confirmed.is_some());
    }

    #[tokio::test]
    async fn test_block_endpoints_skips_direct_probes() {
        let mut f = fixture(true, &[40001]).await;
        f.session.probe(Instant::now());
        assert!(f.session.pending.is_empty());
    }

    #[tokio::test]
    async fn test_probe_round_is_capped() {
        let ports: Vec<u16> = (41000..41020).collect();
        let mut f = fixture(false, &ports).await;
        f.session.probe(Instant::now());
        assert_eq!(f.session.pending.len(), MAX_PROBES_PER_ROUND);
    }

    #[tokio::test]
    async fn test_direct_promotion_needs_consecutive_pongs() {
        let mut f = fixture(false, &[40001]).await;
        f.session.establish(PathKind::Relay(1), Instant::now(), Duration::from_millis(20));

        for round in 1..=3u32 {
            f.session.send_ping(direct(40001), None);
            let tx = pending_for(&f.session, direct(40001))[0];
            f.session.on_pong(tx, Instant::now());
            let expected = if round < 3 {
                SessionState::RelayEstablished
            } else {
                SessionState::DirectEstablished
            };
            assert_eq!(f.status.borrow().state, expected, "after {round} pongs");
        }
    }

    #[tokio::test]
    async fn test_streak_resets_on_other_endpoint() {
        let mut f = fixture(false, &[40001, 40002]).await;
        f.session.establish(PathKind::Relay(1), Instant::now(), Duration::from_millis(20));
        for port in [40001, 40001, 40002, 40001] {
            f.session.send_ping(direct(port), None);
            let tx = pending_for(&f.session, direct(port))[0];
            f.session.on_pong(tx, Instant::now());
        }
        assert_eq!(f.session.state, SessionState::RelayEstablished);
        assert_eq!(f.session.streak, Some((([127, 0, 0, 1], 40001).into(), 1)));
    }

    #[tokio::test]
    async fn test_path_timeout_drops_to_negotiating() {
        let mut f = fixture(false, &[40001]).await;
        let then = Instant::now();
        f.session.establish(direct(40001), then, Duration::from_millis(1));
        f.session.expire(then + Duration::from_secs(1));
        assert!(f.session.state.is_established());
        f.session.expire(then + EngineTimings::default().path_timeout + Duration::from_secs(1));
        assert_eq!(f.status.borrow().state, SessionState::Negotiating);
        assert_eq!(f.status.borrow().path, None);
    }

    #[tokio::test]
    async fn test_peer_gone_drops_relay_path() {
        let mut f = fixture(true, &[]).await;
        f.session.establish(PathKind::Relay(1), Instant::now(), Duration::from_millis(5));
        assert!(!f.session.handle(SessionEvent::PeerGone { region: 2 }));
        assert!(f.session.state.is_established());
        assert!(f.session.handle(SessionEvent::PeerGone { region: 1 }));
        assert_eq!(f.session.state, SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_unknown_pong_ignored() {
        let mut f = fixture(false, &[40001]).await;
        f.session.on_pong(12345, Instant::now());
        assert_eq!(f.session.state, SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_ping_received_learns_address() {
        let mut f = fixture(false, &[]).await;
        assert!(f.session.on_ping_received(direct(45000)));
        assert_eq!(f.session.learned, vec![([127, 0, 0, 1], 45000).into()]);
        f.session.probe(Instant::now());
        assert_eq!(pending_for(&f.session, direct(45000)).len(), 1);
    }

    #[test]
    fn test_confirmed_since() {
        let mut status = PeerStatus::new(Node::new(NodeKey::from_bytes([1; 32])));
        let start = Instant::now();
        status.state = SessionState::RelayEstablished;
        status.last_confirmed = Some(start);
        assert!(status.confirmed_since(start));
        assert!(!status.confirmed_since(start + Duration::from_millis(1)));
        status.state = SessionState::Negotiating;
        assert!(!status.confirmed_since(start));
    }
}
