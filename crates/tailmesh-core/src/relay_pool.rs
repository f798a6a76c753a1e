//! Relay client pool: one worker per region in the current relay map.
//!
//! ```text
//!            set_map()                       send(region, dest, bytes)
//!               │                                       │
//!               ▼                                       ▼
//!   ┌──────────────────────┐   outbound mpsc   ┌─────────────────┐
//!   │ regions: id → handle │ ─────────────────►│  region worker  │──► relay
//!   └──────────────────────┘                   │ connect/health  │◄── relay
//!               │                              └─────────────────┘
//!               ▼                                       │ RecvPacket / PeerGone
//!      RegionSelector ──► LocalNode               inbound mpsc ──► dispatcher
//! ```
//!
//! Workers connect to the first reachable node of their region, register
//! the local key and ping the relay on every health tick. Round trips feed
//! the [`RegionSelector`]; the preferred region goes into the local node.
//! A native upgrade refused by an intermediary falls back to WebSocket and
//! the reason is advertised per region until the region leaves the map.

use crate::callback::LocalNode;
use crate::config::EngineTimings;
use crate::magicsock::Inbound;
use crate::session::PathKind;
use crate::{EngineError, Node};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tailmesh_crypto::{NodeKey, NodePrivate};
use tailmesh_relay::client::{ClientReader, ConnectOptions, RelayClient};
use tailmesh_relay::protocol::RelayMessage;
use tailmesh_relay::selection::RegionSelector;
use tailmesh_relay::{RegionId, RelayError, RelayMap, RelayNode};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Packets queued per region while the worker writes.
const OUTBOUND_QUEUE: usize = 256;

struct RegionHandle {
    nodes: Vec<RelayNode>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<(NodeKey, Vec<u8>)>,
}

struct PoolInner {
    private: NodePrivate,
    map: RwLock<Arc<RelayMap>>,
    regions: Mutex<HashMap<RegionId, RegionHandle>>,
    selector: Mutex<RegionSelector>,
    local: Arc<LocalNode>,
    inbound: mpsc::Sender<Inbound>,
    timings: EngineTimings,
    tracker: TaskTracker,
    cancel: CancellationToken,
    /// Bumped when the set of usable regions changes
    routes: watch::Sender<u64>,
    /// Bumped when the map is replaced
    maps: watch::Sender<u64>,
}

/// Handle to the pool; cheap to clone.
#[derive(Clone)]
pub(crate) struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    pub(crate) fn new(
        private: NodePrivate,
        local: Arc<LocalNode>,
        inbound: mpsc::Sender<Inbound>,
        timings: EngineTimings,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (routes, _) = watch::channel(0);
        let (maps, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                private,
                map: RwLock::new(Arc::new(RelayMap::new())),
                regions: Mutex::new(HashMap::new()),
                selector: Mutex::new(RegionSelector::new()),
                local,
                inbound,
                timings,
                tracker,
                cancel,
                routes,
                maps,
            }),
        }
    }

    /// Current map snapshot.
    pub(crate) fn map(&self) -> Arc<RelayMap> {
        self.inner
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the relay map.
    ///
    /// Workers for regions that disappeared or whose nodes changed are
    /// stopped, new ones are started, and everything the local node says
    /// about removed regions is dropped.
    pub(crate) fn set_map(&self, map: RelayMap) {
        let map = Arc::new(map);
        let ids = map.region_ids();
        *self.inner.map.write().unwrap_or_else(PoisonError::into_inner) = map.clone();

        let mut stale = Vec::new();
        {
            let mut regions = lock(&self.inner.regions);
            regions.retain(|id, handle| {
                let keep = map.region(*id).is_some_and(|r| r.nodes == handle.nodes);
                if !keep {
                    handle.cancel.cancel();
                    stale.push(*id);
                }
                keep
            });
            for region in map.regions.values() {
                if !regions.contains_key(&region.region_id) {
                    let handle = self.inner.start_region(region.region_id, region.nodes.clone());
                    regions.insert(region.region_id, handle);
                }
            }
        }

        for id in &stale {
            self.inner.local.remove_forced(*id);
        }
        self.inner.update_selector(|selector| {
            for id in &stale {
                selector.remove(*id);
            }
            selector.retain(&ids);
        });
        self.inner.local.retain_regions(&ids);
        tracing::info!(regions = ?ids, stopped = ?stale, "relay map updated");
        self.inner.maps.send_modify(|v| *v += 1);
        self.inner.routes.send_modify(|v| *v += 1);
    }

    /// Queue a packet for `dest` through `region`. Packets are dropped when
    /// the region's queue is full.
    pub(crate) fn send(&self, region: RegionId, dest: NodeKey, payload: Vec<u8>) -> Result<(), EngineError> {
        let regions = lock(&self.inner.regions);
        let handle = regions
            .get(&region)
            .ok_or_else(|| EngineError::NoRoute(format!("relay region {region}")))?;
        if let Err(e) = handle.outbound.try_send((dest, payload)) {
            tracing::debug!(region, "relay queue rejected packet: {e}");
        }
        Ok(())
    }

    pub(crate) fn is_healthy(&self, region: RegionId) -> bool {
        lock(&self.inner.selector).is_healthy(region)
    }

    /// Region to reach `peer` through: its preferred region if we are
    /// connected there, else the connected region it measured fastest.
    pub(crate) fn route_for(&self, peer: &Node) -> Option<RegionId> {
        let map = self.map();
        let selector = lock(&self.inner.selector);
        let usable = |id: RegionId| id != 0 && map.region(id).is_some() && selector.is_healthy(id);
        if usable(peer.preferred_relay) {
            return Some(peer.preferred_relay);
        }
        peer.regions_by_latency().into_iter().find(|id| usable(*id))
    }

    /// STUN responders advertised by the current map.
    pub(crate) fn stun_addrs(&self) -> Vec<SocketAddr> {
        self.map()
            .regions
            .values()
            .flat_map(|r| r.nodes.iter())
            .filter_map(|n| n.stun_addr)
            .collect()
    }

    /// Notified when usable regions change.
    pub(crate) fn subscribe_routes(&self) -> watch::Receiver<u64> {
        self.inner.routes.subscribe()
    }

    /// Notified when the map is replaced.
    pub(crate) fn subscribe_maps(&self) -> watch::Receiver<u64> {
        self.inner.maps.subscribe()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolInner {
    fn start_region(self: &Arc<Self>, region: RegionId, nodes: Vec<RelayNode>) -> RegionHandle {
        let cancel = self.cancel.child_token();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.tracker.spawn(run_region(
            self.clone(),
            region,
            nodes.clone(),
            rx,
            cancel.clone(),
        )
        .in_current_span());
        RegionHandle {
            nodes,
            cancel,
            outbound,
        }
    }

    /// Mutate the selector, then publish the preference and notify
    /// sessions if the usable set moved.
    fn update_selector(&self, f: impl FnOnce(&mut RegionSelector)) {
        let (before, after, preferred, report) = {
            let mut selector = lock(&self.selector);
            let mut before = selector.failover_order();
            f(&mut selector);
            let mut after = selector.failover_order();
            before.sort_unstable();
            after.sort_unstable();
            (before, after, selector.preferred(), selector.latency_report())
        };
        let latency_ms = report
            .into_iter()
            .map(|(id, secs)| (id, secs * 1000.0))
            .collect();
        self.local.set_relay(preferred, latency_ms);
        if before != after {
            tracing::debug!(healthy = ?after, "usable relay regions changed");
            self.routes.send_modify(|v| *v += 1);
        }
    }

    async fn connect(&self, region: RegionId, nodes: &[RelayNode]) -> Result<RelayClient, RelayError> {
        let mut last = RelayError::Handshake(format!("region {region} has no nodes"));
        for node in nodes {
            let opts = ConnectOptions {
                forced_websocket: self.local.forced(region),
                timeout: self.timings.relay_connect_timeout,
            };
            match RelayClient::connect(node, &self.private, &opts).await {
                Ok(client) => {
                    match client.forced_websocket() {
                        Some(reason) => {
                            if opts.forced_websocket.is_none() {
                                tracing::warn!(region, relay = %node.name, "relay reached over WebSocket: {reason}");
                            }
                            self.local.set_forced(region, reason);
                        }
                        None => self.local.remove_forced(region),
                    }
                    tracing::info!(region, relay = %node.name, "relay connected");
                    return Ok(client);
                }
                Err(e) => {
                    tracing::debug!(region, relay = %node.name, "relay connect failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

async fn run_region(
    inner: Arc<PoolInner>,
    region: RegionId,
    nodes: Vec<RelayNode>,
    mut outbound: mpsc::Receiver<(NodeKey, Vec<u8>)>,
    cancel: CancellationToken,
) {
    let timings = inner.timings.clone();
    let mut backoff = timings.reconnect_backoff_min;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = inner.connect(region, &nodes) => res,
        };

        match result {
            Ok(client) => {
                backoff = timings.reconnect_backoff_min;
                match serve(&inner, region, client, &mut outbound, &cancel).await {
                    Ok(()) => break,
                    Err(e) => tracing::warn!(region, "relay connection lost: {e}"),
                }
            }
            Err(e) => tracing::warn!(region, retry_in = ?backoff, "relay unreachable: {e}"),
        }

        inner.update_selector(|s| s.record_failure(region));

        // Nothing can be delivered while disconnected.
        while outbound.try_recv().is_ok() {}

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, timings.reconnect_backoff_max);
    }

    tracing::debug!(region, "relay worker stopped");
}

/// Run one connection until it fails (`Err`) or the worker is cancelled.
async fn serve(
    inner: &Arc<PoolInner>,
    region: RegionId,
    client: RelayClient,
    outbound: &mut mpsc::Receiver<(NodeKey, Vec<u8>)>,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    let (reader, mut writer) = client.into_parts();
    let (pong_tx, mut pong_rx) = mpsc::channel::<[u8; 8]>(8);
    let reader_done = cancel.child_token();
    let _stop_reader = reader_done.clone().drop_guard();
    inner.tracker.spawn(read_loop(
        reader,
        region,
        inner.inbound.clone(),
        pong_tx,
        reader_done.clone(),
    )
    .in_current_span());

    let timings = &inner.timings;
    let mut health = tokio::time::interval(timings.relay_health_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut probe: Option<([u8; 8], Instant)> = None;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = writer.write_message(&RelayMessage::Disconnect).await;
                let _ = writer.close().await;
                return Ok(());
            }
            _ = reader_done.cancelled() => return Err(RelayError::Closed),
            Some(data) = pong_rx.recv() => {
                if let Some((_, at)) = probe.take_if(|(sent, _)| *sent == data) {
                    last_pong = Instant::now();
                    let rtt = at.elapsed();
                    inner.update_selector(|s| s.record_success(region, rtt));
                }
            }
            Some((dest, payload)) = outbound.recv() => {
                writer.write_message(&RelayMessage::SendPacket { dest, payload }).await?;
            }
            _ = health.tick() => {
                if last_pong.elapsed() > timings.relay_health_timeout {
                    return Err(RelayError::Timeout);
                }
                let data: [u8; 8] = rand::random();
                probe = Some((data, Instant::now()));
                writer.write_message(&RelayMessage::Ping { data }).await?;
            }
        }
    }
}

async fn read_loop(
    mut reader: ClientReader,
    region: RegionId,
    inbound: mpsc::Sender<Inbound>,
    pongs: mpsc::Sender<[u8; 8]>,
    done: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = done.cancelled() => return,
            msg = reader.read_message() => msg,
        };
        match msg {
            Ok(RelayMessage::RecvPacket { src, payload }) => {
                let packet = Inbound::Packet {
                    from: Some(src),
                    path: PathKind::Relay(region),
                    bytes: payload,
                };
                if inbound.try_send(packet).is_err() {
                    tracing::debug!(region, "inbound queue full, dropping relayed packet");
                }
            }
            Ok(RelayMessage::PeerGone { peer }) => {
                let _ = inbound.try_send(Inbound::PeerGone { region, peer });
            }
            Ok(RelayMessage::Pong { data }) => {
                let _ = pongs.try_send(data);
            }
            Ok(RelayMessage::Error { code, message }) => {
                tracing::warn!(region, ?code, "relay error: {message}");
            }
            Ok(RelayMessage::Keepalive) => {}
            Ok(RelayMessage::Disconnect) => {
                tracing::debug!(region, "relay said goodbye");
                break;
            }
            Ok(other) => {
                tracing::debug!(region, kind = other.message_type(), "unexpected relay message");
            }
            Err(e) => {
                tracing::debug!(region, "relay read ended: {e}");
                break;
            }
        }
    }
    done.cancel();
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverlayPrefix;
    use crate::callback::{CallbackSlot, run_dispatcher};
    use std::collections::BTreeMap;
    use tailmesh_relay::RelayRegion;

    /// Workers of a pool built on a cancelled token exit before connecting,
    /// leaving the selector to the test.
    fn pool(tracker: &TaskTracker, cancel: &CancellationToken) -> (RelayPool, Arc<LocalNode>) {
        cancel.cancel();
        let private = NodePrivate::from_bytes([1; 32]);
        let local = Arc::new(LocalNode::new(
            private.public_key(),
            vec![OverlayPrefix::random()],
            true,
        ));
        let (tx, _rx) = mpsc::channel(16);
        let pool = RelayPool::new(
            private,
            local.clone(),
            tx,
            EngineTimings::default(),
            tracker.clone(),
            cancel.clone(),
        );
        (pool, local)
    }

    fn unreachable_map(ids: &[RegionId]) -> RelayMap {
        let mut map = RelayMap::new();
        for id in ids {
            let url = url::Url::parse("http://127.0.0.1:1").unwrap();
            map = map.with_region(
                RelayRegion::new(*id, format!("r{id}"), "test")
                    .with_node(RelayNode::new(format!("{id}a"), *id, url)),
            );
        }
        map
    }

    #[test]
    fn test_backoff_is_capped() {
        let timings = EngineTimings::default();
        let mut b = timings.reconnect_backoff_min;
        b = next_backoff(b, timings.reconnect_backoff_max);
        assert_eq!(b, timings.reconnect_backoff_min * 2);
        for _ in 0..20 {
            b = next_backoff(b, timings.reconnect_backoff_max);
        }
        assert_eq!(b, timings.reconnect_backoff_max);
    }

    #[tokio::test]
    async fn test_route_prefers_peer_region_when_healthy() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (pool, _) = pool(&tracker, &cancel);
        pool.set_map(unreachable_map(&[1, 2, 3]));

        pool.inner.update_selector(|s| {
            s.record_success(1, Duration::from_millis(5));
            s.record_success(2, Duration::from_millis(9));
        });

        let mut peer = Node::new(NodeKey::from_bytes([2; 32]));
        assert_eq!(pool.route_for(&peer), None);

        peer.preferred_relay = 2;
        assert_eq!(pool.route_for(&peer), Some(2));

        peer.preferred_relay = 3;
        peer.relay_latency = BTreeMap::from([(3, 1.0), (1, 20.0), (2, 4.0)]);
        assert_eq!(pool.route_for(&peer), Some(2));

        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_set_map_drops_removed_regions() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (pool, local) = pool(&tracker, &cancel);
        let mut routes = pool.subscribe_routes();

        pool.set_map(unreachable_map(&[1, 2]));
        pool.inner.update_selector(|s| s.record_success(1, Duration::from_millis(5)));
        local.set_forced(1, "proxy");
        assert_eq!(local.snapshot().preferred_relay, 1);
        assert!(routes.has_changed().unwrap());
        routes.borrow_and_update();

        pool.set_map(unreachable_map(&[2]));
        assert!(routes.has_changed().unwrap());
        assert!(!pool.is_healthy(1));
        let node = local.snapshot();
        assert_eq!(node.preferred_relay, 0);
        assert!(node.forced_websocket.is_empty());
        assert!(pool.send(1, NodeKey::from_bytes([3; 32]), vec![1]).is_err());
        assert!(pool.send(2, NodeKey::from_bytes([3; 32]), vec![1]).is_ok());

        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_preference_flip_notifies_once() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (pool, local) = pool(&tracker, &cancel);
        pool.set_map(unreachable_map(&[1, 2]));
        pool.inner.update_selector(|s| {
            s.record_success(1, Duration::from_millis(5));
            s.record_success(2, Duration::from_millis(40));
        });

        let slot = Arc::new(CallbackSlot::default());
        let stop = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(local.clone(), slot.clone(), stop.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.set(Arc::new(move |node: Node| {
            let _ = tx.send(node.preferred_relay);
        }));
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(1));

        // Region 2 speeds up past region 1; every other sample only moves
        // latency and must not notify on its own.
        for ms in [30, 20, 3, 2, 1] {
            pool.inner
                .update_selector(|s| s.record_success(2, Duration::from_millis(ms)));
        }
        pool.inner
            .update_selector(|s| s.record_success(1, Duration::from_millis(6)));

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(second, Some(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!((local.snapshot().relay_latency[&2] - 1.0).abs() < 1e-9);

        stop.cancel();
        dispatcher.await.unwrap();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_stun_addrs_from_map() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (pool, _) = pool(&tracker, &cancel);
        let url = url::Url::parse("http://127.0.0.1:1").unwrap();
        let stun: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        pool.set_map(RelayMap::new().with_region(
            RelayRegion::new(1, "r1", "test")
                .with_node(RelayNode::new("1a", 1, url).with_stun(stun)),
        ));
        assert_eq!(pool.stun_addrs(), vec![stun]);
        tracker.close();
        tracker.wait().await;
    }
}
