//! The overlay engine.
//!
//! An [`Engine`] owns one underlay UDP socket, one connection per relay
//! region, a session worker per known peer and the overlay netstack:
//!
//! ```text
//!            update_nodes ──► Directory ──► SessionHandle ─┐
//!                                                           ▼
//!  ┌─────────┐  Inbound   ┌────────────┐  SessionEvent  ┌─────────┐
//!  │Magicsock│──────────► │ dispatcher │ ─────────────► │ session │
//!  │ + relays│ ◄──────────│            │                └─────────┘
//!  └─────────┘  Pong      └─────┬──────┘                     │ path
//!       ▲                       │ Stream frames               ▼
//!       └────────────────── Netstack ◄──── OverlayStream / OverlayListener
//! ```
//!
//! Every worker runs on one `TaskTracker` under one `CancellationToken`;
//! [`Engine::close`] cancels the token and waits for the tracker to drain.

use crate::callback::{run_dispatcher, CallbackSlot, LocalNode, NodeCallback};
use crate::directory::Directory;
use crate::magicsock::{self, Inbound, Magicsock, Message};
use crate::netstack::{Frame, Netstack, PeerLink};
use crate::relay_pool::RelayPool;
use crate::session::{PathKind, PeerStatus, SessionContext, SessionEvent, SessionHandle};
use crate::{Endpoint, EndpointSource, EngineError, Node, Options, OverlayPrefix, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tailmesh_crypto::{NodeKey, NodePrivate, PeerCipher};
use tailmesh_relay::RelayMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Packets queued between the socket readers and the dispatcher.
const INBOUND_QUEUE: usize = 1024;

/// State shared by the engine handle and its workers.
pub(crate) struct Shared {
    private: NodePrivate,
    key: NodeKey,
    local: Arc<LocalNode>,
    directory: Mutex<Directory>,
    sessions: DashMap<NodeKey, SessionHandle>,
    sock: Arc<Magicsock>,
    ctx: Arc<SessionContext>,
    /// Bumped whenever the set of peers or relays changes
    topology: watch::Sender<u64>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn session(&self, key: &NodeKey) -> Option<SessionHandle> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    /// The session of whichever peer owns `ip`.
    pub(crate) fn session_for_ip(&self, ip: &IpAddr) -> Option<SessionHandle> {
        let owner = lock(&self.directory).owner_of(ip)?;
        self.session(&owner)
    }

    pub(crate) fn subscribe_topology(&self) -> watch::Receiver<u64> {
        self.topology.subscribe()
    }

    fn bump_topology(&self) {
        self.topology.send_modify(|v| *v += 1);
    }

    fn on_packet(&self, netstack: &Arc<Netstack>, from: Option<NodeKey>, path: PathKind, bytes: &[u8]) {
        let Some(claimed) = magicsock::sender(bytes) else {
            tracing::debug!(%path, "dropping malformed packet");
            return;
        };
        if from.is_some_and(|relayed| relayed != claimed) {
            tracing::debug!(%path, claimed = %claimed.short(), "relay sender does not match packet header");
            return;
        }
        let Some(session) = self.session(&claimed) else {
            tracing::debug!(%path, peer = %claimed.short(), "packet from unknown peer");
            return;
        };
        let msg = match magicsock::open(session.cipher(), bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%path, peer = %claimed.short(), "dropping packet: {e}");
                return;
            }
        };

        match msg {
            Message::Ping { tx_id } => {
                let observed = match path {
                    PathKind::Direct(addr) => Some(addr),
                    PathKind::Relay(_) => None,
                };
                if let Err(e) = self.sock.send(session.cipher(), &path, &Message::Pong { tx_id, observed }) {
                    tracing::debug!(%path, peer = %claimed.short(), "pong not sent: {e}");
                }
                session.send(SessionEvent::PingReceived { path });
            }
            Message::Pong { tx_id, observed } => {
                session.send(SessionEvent::Pong { tx_id });
                if let Some(addr) = observed.filter(|_| !self.ctx.block_endpoints) {
                    self.local.add_endpoint(Endpoint::new(addr, EndpointSource::Relay));
                }
            }
            Message::Stream(frame) => {
                let owns_source = lock(&self.directory)
                    .get(&claimed)
                    .is_some_and(|node| node.owns(&frame.src.ip()));
                if !owns_source {
                    tracing::debug!(peer = %claimed.short(), src = %frame.src, "peer sent frame from foreign address");
                    return;
                }
                netstack.deliver(frame);
            }
        }
    }
}

impl PeerLink for Shared {
    fn send_frame(&self, frame: Frame) -> Result<()> {
        let no_route = || EngineError::NoRoute(frame.dst.ip().to_string());
        let session = self.session_for_ip(&frame.dst.ip()).ok_or_else(no_route)?;
        let path = session.path().ok_or_else(no_route)?;
        self.sock.send(session.cipher(), &path, &Message::Stream(frame))
    }
}

/// Route inbound packets to sessions and the netstack until cancelled.
async fn run_inbound(
    shared: Arc<Shared>,
    netstack: Arc<Netstack>,
    mut inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        match item {
            Inbound::Packet { from, path, bytes } => shared.on_packet(&netstack, from, path, &bytes),
            Inbound::PeerGone { region, peer } => {
                if let Some(session) = shared.session(&peer) {
                    tracing::debug!(peer = %peer.short(), region, "peer gone from relay");
                    session.send(SessionEvent::PeerGone { region });
                }
            }
        }
    }
}

struct EngineInner {
    name: String,
    addresses: Vec<OverlayPrefix>,
    shared: Arc<Shared>,
    netstack: Arc<Netstack>,
    slot: Arc<CallbackSlot>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    span: tracing::Span,
}

/// Handle to a running overlay engine; cheap to clone.
///
/// # Example
///
/// ```no_run
/// use tailmesh_core::{Engine, Options, OverlayPrefix};
/// use tailmesh_relay::RelayMap;
///
/// # async fn demo(map: RelayMap) -> tailmesh_core::Result<()> {
/// let engine = Engine::new(Options::new(vec![OverlayPrefix::random()], map)).await?;
/// engine.set_node_callback(|node| {
///     // ship `node` to peers out of band
///     let _ = node.to_json();
/// })?;
/// engine.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Construct an engine and start its workers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] if the options are invalid or
    /// the underlay socket cannot be bound.
    pub async fn new(options: Options) -> Result<Self> {
        options.validate()?;
        let private = options.node_key.clone().unwrap_or_else(NodePrivate::generate);
        let key = private.public_key();
        let name = if options.name.is_empty() {
            key.short()
        } else {
            options.name.clone()
        };
        let span = tracing::info_span!("engine", name = %name);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let timings = options.timings.clone();
        let local = Arc::new(LocalNode::new(
            key,
            options.addresses.clone(),
            options.relay_map.is_empty(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let pool = RelayPool::new(
            private.clone(),
            local.clone(),
            inbound_tx.clone(),
            timings.clone(),
            tracker.clone(),
            cancel.clone(),
        );
        let sock = Magicsock::bind(key, options.listen_port, pool.clone())
            .map(Arc::new)
            .map_err(|e| EngineError::Construction(format!("underlay socket: {e}").into()))?;
        let port = sock.local_port()?;

        let shared = Arc::new(Shared {
            private,
            key,
            local: local.clone(),
            directory: Mutex::new(Directory::new(key)),
            sessions: DashMap::new(),
            sock: sock.clone(),
            ctx: Arc::new(SessionContext {
                sock: sock.clone(),
                timings: timings.clone(),
                block_endpoints: options.block_endpoints,
            }),
            topology: watch::channel(0).0,
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        });
        let local_ips = options.addresses.iter().map(OverlayPrefix::addr).collect();
        let netstack = Arc::new(Netstack::new(
            shared.clone(),
            local_ips,
            timings.clone(),
            tracker.clone(),
            cancel.clone(),
        ));
        let slot = Arc::new(CallbackSlot::default());

        tracker.spawn(
            sock.clone()
                .run_reader(inbound_tx, cancel.clone())
                .instrument(span.clone()),
        );
        tracker.spawn(run_inbound(shared.clone(), netstack.clone(), inbound_rx, cancel.clone()).instrument(span.clone()));
        tracker.spawn(run_dispatcher(local.clone(), slot.clone(), cancel.clone()).instrument(span.clone()));
        if options.block_endpoints {
            tracing::info!(parent: &span, "direct endpoints disabled, relay only");
        } else {
            tracker.spawn(
                sock.clone()
                    .run_discovery(local, timings, tracker.clone(), cancel.clone())
                    .instrument(span.clone()),
            );
        }
        span.in_scope(|| pool.set_map(options.relay_map));

        tracing::info!(
            parent: &span,
            key = %key.short(),
            port,
            addresses = ?options.addresses,
            "engine started"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                name,
                addresses: options.addresses,
                shared,
                netstack,
                slot,
                tracker,
                cancel,
                span,
            }),
        })
    }

    /// Stop every worker and wait for them to exit. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.cancel.is_cancelled() {
            tracing::info!(parent: &inner.span, "closing engine");
        }
        inner.cancel.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        inner.slot.clear();
        inner.shared.sessions.clear();
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn netstack(&self) -> &Arc<Netstack> {
        &self.inner.netstack
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    /// Engine name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local identity key
    #[must_use]
    pub fn key(&self) -> NodeKey {
        self.inner.shared.key
    }

    /// Local overlay addresses
    #[must_use]
    pub fn addresses(&self) -> &[OverlayPrefix] {
        &self.inner.addresses
    }

    /// Snapshot of the local node as peers would see it.
    #[must_use]
    pub fn node(&self) -> Node {
        self.inner.shared.local.snapshot()
    }

    /// Current relay map
    #[must_use]
    pub fn relay_map(&self) -> RelayMap {
        RelayMap::clone(&self.inner.shared.sock.pool().map())
    }

    /// Register the single node observer, replacing any previous one.
    ///
    /// The current node is delivered right away if it is ready to
    /// advertise; afterwards only peer-visible changes trigger a call.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] after [`Engine::close`].
    pub fn set_node_callback(&self, callback: impl Fn(Node) + Send + Sync + 'static) -> Result<()> {
        self.ensure_open()?;
        let callback: NodeCallback = Arc::new(callback);
        self.inner.slot.set(callback);
        Ok(())
    }

    /// Merge (`replace = false`) or replace peer descriptors.
    ///
    /// Sessions see the new descriptors before this returns.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidNode`] if any descriptor is rejected; nothing
    ///   from the batch is applied
    /// - [`EngineError::Crypto`] if a new peer key is unusable
    /// - [`EngineError::Closed`] after [`Engine::close`]
    pub fn update_nodes(&self, nodes: &[Node], replace: bool) -> Result<()> {
        self.ensure_open()?;
        let _enter = self.inner.span.enter();
        let shared = &self.inner.shared;

        // Derive keys for new peers up front so a bad key rejects the batch.
        let mut ciphers = HashMap::new();
        let new_keys = nodes
            .iter()
            .map(|n| n.key)
            .filter(|k| *k != shared.key && !k.is_zero() && !shared.sessions.contains_key(k));
        for key in new_keys {
            if let std::collections::hash_map::Entry::Vacant(slot) = ciphers.entry(key) {
                slot.insert(Arc::new(PeerCipher::new(&shared.private, &key)?));
            }
        }

        {
            // Held while sessions are fed so per-peer order follows call order.
            let mut directory = lock(&shared.directory);
            let applied = directory.apply(nodes, replace)?;
            for node in applied {
                match shared.sessions.entry(node.key) {
                    Entry::Occupied(entry) => {
                        entry.get().send(SessionEvent::NodeUpdated(node));
                    }
                    Entry::Vacant(entry) => {
                        let Some(cipher) = ciphers.remove(&node.key) else {
                            continue;
                        };
                        tracing::info!(peer = %node.key.short(), addresses = ?node.addresses, "new peer");
                        entry.insert(SessionHandle::spawn(
                            shared.ctx.clone(),
                            node,
                            cipher,
                            &shared.tracker,
                            &shared.cancel,
                        ));
                    }
                }
            }
        }
        shared.bump_topology();
        Ok(())
    }

    /// Forget peers and close their sessions. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] after [`Engine::close`].
    pub fn remove_nodes(&self, keys: &[NodeKey]) -> Result<()> {
        self.ensure_open()?;
        let shared = &self.inner.shared;
        let removed = lock(&shared.directory).remove(keys);
        for key in &removed {
            if let Some((_, session)) = shared.sessions.remove(key) {
                session.close();
            }
            tracing::info!(parent: &self.inner.span, peer = %key.short(), "peer removed");
        }
        if !removed.is_empty() {
            shared.bump_topology();
        }
        Ok(())
    }

    /// Swap the relay map, reconnecting regions that changed.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Relay`] if the map is malformed
    /// - [`EngineError::Closed`] after [`Engine::close`]
    pub fn set_relay_map(&self, map: RelayMap) -> Result<()> {
        self.ensure_open()?;
        map.validate()?;
        let shared = &self.inner.shared;
        tracing::info!(parent: &self.inner.span, regions = ?map.region_ids(), "relay map updated");
        self.inner.span.in_scope(|| shared.sock.pool().set_map(map));
        shared.bump_topology();
        Ok(())
    }

    /// Status of one peer's session.
    #[must_use]
    pub fn peer_status(&self, key: &NodeKey) -> Option<PeerStatus> {
        self.inner.shared.session(key).map(|s| s.status())
    }

    /// Status of every known peer.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerStatus> {
        self.inner
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().status())
            .collect()
    }

    /// Measure the round trip to the peer owning `ip` over its current path.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NoRoute`] if no peer owns `ip`, it has no path, or
    ///   the ping went unanswered
    /// - [`EngineError::Cancelled`] / [`EngineError::Closed`] if waiting was
    ///   abandoned
    pub async fn ping(&self, cancel: &CancellationToken, ip: IpAddr) -> Result<(Duration, PathKind)> {
        self.ensure_open()?;
        let session = self
            .inner
            .shared
            .session_for_ip(&ip)
            .ok_or_else(|| EngineError::NoRoute(ip.to_string()))?;
        let (tx, rx) = oneshot::channel();
        if !session.send(SessionEvent::Ping(tx)) {
            return Err(EngineError::Closed);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = self.inner.cancel.cancelled() => Err(EngineError::Closed),
            res = rx => res.map_err(|_| EngineError::NoRoute(ip.to_string())),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("key", &self.inner.shared.key)
            .field("addresses", &self.inner.addresses)
            .finish_non_exhaustive()
    }
}
