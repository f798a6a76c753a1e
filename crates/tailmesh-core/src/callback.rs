//! Local node state and the node callback.
//!
//! [`LocalNode`] holds the descriptor this engine advertises. Relay
//! workers and endpoint discovery write to it; every change a peer would
//! care about bumps a generation counter. A single dispatcher task watches
//! that counter and hands the current snapshot to the registered callback,
//! so the callback never runs concurrently with itself and bursts of
//! changes collapse into one invocation.

use crate::node::now_millis;
use crate::{Endpoint, Node, OverlayPrefix};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tailmesh_crypto::NodeKey;
use tailmesh_relay::RegionId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Callback receiving the local node after each peer-visible change.
pub type NodeCallback = Arc<dyn Fn(Node) + Send + Sync>;

#[derive(Debug)]
struct LocalState {
    node: Node,
    generation: u64,
    map_empty: bool,
}

/// The descriptor this engine advertises.
#[derive(Debug)]
pub(crate) struct LocalNode {
    state: Mutex<LocalState>,
    changed: watch::Sender<u64>,
}

impl LocalNode {
    pub(crate) fn new(key: NodeKey, addresses: Vec<OverlayPrefix>, map_empty: bool) -> Self {
        let mut node = Node::new(key);
        node.id = rand::random::<u64>() >> 1;
        node.as_of = now_millis();
        node.allowed_ips.clone_from(&addresses);
        node.addresses = addresses;
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(LocalState {
                node,
                generation: 0,
                map_empty,
            }),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply `f`; if it reports a peer-visible change, stamp the node and
    /// wake the dispatcher.
    fn update(&self, f: impl FnOnce(&mut LocalState) -> bool) {
        let generation = {
            let mut state = self.lock();
            if !f(&mut state) {
                return;
            }
            state.node.as_of = now_millis().max(state.node.as_of + 1);
            state.generation += 1;
            state.generation
        };
        self.changed.send_replace(generation);
    }

    pub(crate) fn snapshot(&self) -> Node {
        self.lock().node.clone()
    }

    fn snapshot_if_ready(&self) -> Option<(Node, u64)> {
        let state = self.lock();
        is_ready(&state).then(|| (state.node.clone(), state.generation))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    pub(crate) fn set_endpoints(&self, mut endpoints: Vec<Endpoint>) {
        dedup_endpoints(&mut endpoints);
        self.update(|state| {
            if state.node.endpoints == endpoints {
                return false;
            }
            tracing::debug!(count = endpoints.len(), "local endpoints changed");
            state.node.endpoints = endpoints;
            true
        });
    }

    /// Add an endpoint a peer observed us on, if not already known.
    pub(crate) fn add_endpoint(&self, endpoint: Endpoint) {
        self.update(|state| {
            if state.node.endpoints.iter().any(|e| e.addr == endpoint.addr) {
                return false;
            }
            tracing::debug!(addr = %endpoint.addr, "peer reported new endpoint");
            state.node.endpoints.push(endpoint);
            true
        });
    }

    /// Record relay selection. A zero preference keeps the last measured
    /// region; latencies are in milliseconds and never wake the dispatcher
    /// on their own.
    pub(crate) fn set_relay(&self, preferred: RegionId, latency: BTreeMap<RegionId, f64>) {
        self.update(|state| {
            state.node.relay_latency = latency;
            if preferred == 0 || preferred == state.node.preferred_relay {
                return false;
            }
            tracing::info!(
                from = state.node.preferred_relay,
                to = preferred,
                "preferred relay changed"
            );
            state.node.preferred_relay = preferred;
            true
        });
    }

    pub(crate) fn forced(&self, region: RegionId) -> Option<String> {
        self.lock().node.forced_websocket.get(&region).cloned()
    }

    pub(crate) fn set_forced(&self, region: RegionId, reason: &str) {
        self.update(|state| {
            if state.node.forced_websocket.get(&region).map(String::as_str) == Some(reason) {
                return false;
            }
            state.node.forced_websocket.insert(region, reason.to_string());
            true
        });
    }

    pub(crate) fn remove_forced(&self, region: RegionId) {
        self.update(|state| state.node.forced_websocket.remove(&region).is_some());
    }

    /// Drop everything that refers to regions outside `regions`.
    pub(crate) fn retain_regions(&self, regions: &[RegionId]) {
        self.update(|state| {
            let node = &mut state.node;
            let before = node.forced_websocket.len();
            node.forced_websocket.retain(|id, _| regions.contains(id));
            node.relay_latency.retain(|id, _| regions.contains(id));
            let mut changed = node.forced_websocket.len() != before;
            if node.preferred_relay != 0 && !regions.contains(&node.preferred_relay) {
                node.preferred_relay = 0;
                changed = true;
            }
            state.map_empty = regions.is_empty();
            changed
        });
    }
}

/// Ready to advertise: a measured relay, or no relays and some endpoint.
fn is_ready(state: &LocalState) -> bool {
    state.node.preferred_relay != 0 || (state.map_empty && !state.node.endpoints.is_empty())
}

fn dedup_endpoints(endpoints: &mut Vec<Endpoint>) {
    let mut seen = std::collections::HashSet::new();
    endpoints.retain(|e| seen.insert(e.addr));
}

/// The registered callback plus a registration counter.
#[derive(Default)]
pub(crate) struct CallbackSlot {
    callback: Mutex<Option<NodeCallback>>,
    epoch: watch::Sender<u64>,
}

impl CallbackSlot {
    pub(crate) fn set(&self, callback: NodeCallback) {
        *self.callback.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Drop the callback; it may hold clones of other engines.
    pub(crate) fn clear(&self) {
        self.callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    fn get(&self) -> Option<NodeCallback> {
        self.callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Deliver local node changes to the callback, one at a time.
pub(crate) async fn run_dispatcher(
    local: Arc<LocalNode>,
    slot: Arc<CallbackSlot>,
    cancel: CancellationToken,
) {
    let mut changes = local.subscribe();
    let mut epochs = slot.epoch.subscribe();
    let mut delivered: Option<(u64, u64)> = None;

    loop {
        let epoch = *epochs.borrow_and_update();
        changes.borrow_and_update();

        if let Some((node, generation)) = local.snapshot_if_ready() {
            if delivered != Some((epoch, generation)) {
                if let Some(callback) = slot.get() {
                    tracing::debug!(generation, preferred = node.preferred_relay, "delivering local node");
                    callback(node);
                    delivered = Some((epoch, generation));
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = changes.changed() => if res.is_err() { break },
            res = epochs.changed() => if res.is_err() { break },
        }
    }
}
