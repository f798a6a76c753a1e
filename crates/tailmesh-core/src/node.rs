//! Node descriptors exchanged between peers.
//!
//! A [`Node`] is a peer's advertised connectivity snapshot. The engine
//! produces one for itself (delivered through the node callback) and
//! ingests the ones the caller relays from other peers. How descriptors
//! travel between peers is up to the caller; JSON helpers are provided.

use crate::{EngineError, OverlayPrefix};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tailmesh_crypto::NodeKey;
use tailmesh_relay::RegionId;

/// How an endpoint was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSource {
    /// Address of a local interface
    Local,
    /// Reflexive address learned from a STUN server
    Stun,
    /// Address observed by a peer and reported back
    Relay,
}

/// A candidate direct endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// UDP address
    pub addr: SocketAddr,
    /// Discovery source
    pub source: EndpointSource,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(addr: SocketAddr, source: EndpointSource) -> Self {
        Self { addr, source }
    }
}

/// A peer's advertised connectivity descriptor.
///
/// Empty or zero fields mean "unknown", which is what lets
/// [`Node::merge_from`] combine partial descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Random numeric id chosen by the owning engine
    #[serde(default)]
    pub id: u64,
    /// Descriptor timestamp (unix milliseconds); 0 means unset
    #[serde(default)]
    pub as_of: u64,
    /// Identity key
    pub key: NodeKey,
    /// Overlay addresses owned by the node
    #[serde(default)]
    pub addresses: Vec<OverlayPrefix>,
    /// Prefixes routed to the node
    #[serde(default)]
    pub allowed_ips: Vec<OverlayPrefix>,
    /// Candidate direct endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Preferred relay region; 0 until measured
    #[serde(default)]
    pub preferred_relay: RegionId,
    /// Measured relay latency per region, in milliseconds
    #[serde(default)]
    pub relay_latency: BTreeMap<RegionId, f64>,
    /// Why the connection to a region is tunnelled over WebSocket
    #[serde(default)]
    pub forced_websocket: BTreeMap<RegionId, String>,
}

impl Node {
    /// Create a descriptor holding only an identity.
    #[must_use]
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Overwrite fields with the non-empty, non-zero fields of `other`.
    ///
    /// The timestamp only moves forward.
    pub fn merge_from(&mut self, other: &Node) {
        if other.id != 0 {
            self.id = other.id;
        }
        self.as_of = self.as_of.max(other.as_of);
        if !other.addresses.is_empty() {
            self.addresses.clone_from(&other.addresses);
        }
        if !other.allowed_ips.is_empty() {
            self.allowed_ips.clone_from(&other.allowed_ips);
        }
        if !other.endpoints.is_empty() {
            self.endpoints.clone_from(&other.endpoints);
        }
        if other.preferred_relay != 0 {
            self.preferred_relay = other.preferred_relay;
        }
        if !other.relay_latency.is_empty() {
            self.relay_latency.clone_from(&other.relay_latency);
        }
        if !other.forced_websocket.is_empty() {
            self.forced_websocket.clone_from(&other.forced_websocket);
        }
    }

    /// Whether `other` would be dropped as stale against this descriptor.
    ///
    /// An unset timestamp on either side is never stale.
    #[must_use]
    pub fn is_newer_than(&self, other: &Node) -> bool {
        self.as_of != 0 && other.as_of != 0 && self.as_of > other.as_of
    }

    /// Whether the node claims `ip` among its addresses or allowed IPs.
    #[must_use]
    pub fn owns(&self, ip: &std::net::IpAddr) -> bool {
        self.addresses.iter().any(|p| p.addr() == *ip)
            || self.allowed_ips.iter().any(|p| p.contains(ip))
    }

    /// Regions from the latency map, lowest latency first.
    #[must_use]
    pub fn regions_by_latency(&self) -> Vec<RegionId> {
        let mut regions: Vec<(RegionId, f64)> =
            self.relay_latency.iter().map(|(id, l)| (*id, *l)).collect();
        regions.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        regions.into_iter().map(|(id, _)| id).collect()
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidNode`] if encoding fails.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::InvalidNode(e.to_string().into()))
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidNode`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidNode(e.to_string().into()))
    }
}

/// Current time in unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
