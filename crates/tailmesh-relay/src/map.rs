//! Relay map: the set of relay regions a node may use.
//!
//! Region ids are small integers and are the stable keys used elsewhere
//! (a node's preferred relay, its forced-websocket reasons, relay latency).
//! A map is treated as an immutable snapshot; reconfiguration swaps the
//! whole map.

use crate::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use url::Url;

/// Relay region identifier. Zero means "no region".
pub type RegionId = u16;

/// A single relay server inside a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Unique node name, e.g. `"1a"`.
    pub name: String,
    /// Region this node belongs to.
    pub region_id: RegionId,
    /// Base URL of the relay HTTP endpoint (`http://host:port`).
    pub url: Url,
    /// STUN responder co-located with this relay, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_addr: Option<SocketAddr>,
}

impl RelayNode {
    /// Create a relay node entry.
    #[must_use]
    pub fn new(name: impl Into<String>, region_id: RegionId, url: Url) -> Self {
        Self {
            name: name.into(),
            region_id,
            url,
            stun_addr: None,
        }
    }

    /// Set the STUN responder address
    #[must_use]
    pub fn with_stun(mut self, addr: SocketAddr) -> Self {
        self.stun_addr = Some(addr);
        self
    }

    /// `host:port` to open a TCP connection to.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidMap`] if the URL has no host or uses a
    /// scheme without a known default port.
    pub fn authority(&self) -> Result<(String, u16), RelayError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| RelayError::InvalidMap(format!("relay {} has no host", self.name)))?;
        let port = self.url.port_or_known_default().ok_or_else(|| {
            RelayError::InvalidMap(format!("relay {} has no port", self.name))
        })?;
        Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
    }
}

/// A numbered group of relay nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    /// Region id, unique within a map.
    pub region_id: RegionId,
    /// Short region code, e.g. `"test"`.
    pub region_code: String,
    /// Human readable name
    pub region_name: String,
    /// Relay nodes, tried in order.
    pub nodes: Vec<RelayNode>,
}

impl RelayRegion {
    /// Create an empty region.
    #[must_use]
    pub fn new(region_id: RegionId, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region_id,
            region_code: code.into(),
            region_name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Add a node to the region.
    #[must_use]
    pub fn with_node(mut self, node: RelayNode) -> Self {
        self.nodes.push(node);
        self
    }
}

/// Snapshot of available relay regions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMap {
    /// Informational version set by whoever publishes the map.
    #[serde(default)]
    pub version: u64,
    /// Regions keyed by region id.
    pub regions: BTreeMap<RegionId, RelayRegion>,
}

impl RelayMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a region.
    #[must_use]
    pub fn with_region(mut self, region: RelayRegion) -> Self {
        self.regions.insert(region.region_id, region);
        self
    }

    /// Look up a region.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&RelayRegion> {
        self.regions.get(&id)
    }

    /// Region ids in ascending order.
    #[must_use]
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.keys().copied().collect()
    }

    /// Whether the map has any regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Move region `from` to id `to`, rewriting the ids of its nodes.
    ///
    /// Returns `false` if `from` does not exist.
    pub fn renumber(&mut self, from: RegionId, to: RegionId) -> bool {
        let Some(mut region) = self.regions.remove(&from) else {
            return false;
        };
        region.region_id = to;
        for node in &mut region.nodes {
            node.region_id = to;
        }
        self.regions.insert(to, region);
        true
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidMap`] if a region uses id 0, its key
    /// disagrees with its `region_id`, it has no nodes, or one of its nodes
    /// claims another region.
    pub fn validate(&self) -> Result<(), RelayError> {
        for (id, region) in &self.regions {
            if *id == 0 {
                return Err(RelayError::InvalidMap("region id 0 is reserved".into()));
            }
            if region.region_id != *id {
                return Err(RelayError::InvalidMap(format!(
                    "region keyed {id} claims id {}",
                    region.region_id
                )));
            }
            if region.nodes.is_empty() {
                return Err(RelayError::InvalidMap(format!("region {id} has no nodes")));
            }
            if let Some(node) = region.nodes.iter().find(|n| n.region_id != *id) {
                return Err(RelayError::InvalidMap(format!(
                    "node {} in region {id} claims region {}",
                    node.name, node.region_id
                )));
            }
        }
        Ok(())
    }

    /// Parse a map from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Deserialization`] on malformed JSON and
    /// [`RelayError::InvalidMap`] if validation fails.
    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        let map: Self =
            serde_json::from_str(json).map_err(|e| RelayError::Deserialization(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    /// Render the map as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string_pretty(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RelayMap {
        let url = Url::parse("http://127.0.0.1:3340").unwrap();
        RelayMap::new().with_region(
            RelayRegion::new(1, "test", "Test Region").with_node(
                RelayNode::new("1a", 1, url).with_stun("127.0.0.1:3478".parse().unwrap()),
            ),
        )
    }

    #[test]
    fn test_region_ids_sorted() {
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let map = sample()
            .with_region(RelayRegion::new(9, "b", "B").with_node(RelayNode::new("9a", 9, url.clone())))
            .with_region(RelayRegion::new(4, "a", "A").with_node(RelayNode::new("4a", 4, url)));
        assert_eq!(map.region_ids(), vec![1, 4, 9]);
    }

    #[test]
    fn test_json_roundtrip() {
        let map = sample();
        let json = map.to_json().unwrap();
        assert_eq!(RelayMap::from_json(&json).unwrap(), map);
    }

    #[test]
    fn test_renumber() {
        let mut map = sample();
        assert!(map.renumber(1, 2));
        assert_eq!(map.region_ids(), vec![2]);
        let region = map.region(2).unwrap();
        assert_eq!(region.region_id, 2);
        assert!(region.nodes.iter().all(|n| n.region_id == 2));
        assert!(map.validate().is_ok());
        assert!(!map.renumber(1, 3));
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let mut map = sample();
        map.regions.get_mut(&1).unwrap().region_id = 5;
        assert!(matches!(map.validate(), Err(RelayError::InvalidMap(_))));
    }

    #[test]
    fn test_validate_rejects_empty_region() {
        let map = RelayMap::new().with_region(RelayRegion::new(3, "x", "X"));
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_authority_default_port() {
        let node = RelayNode::new("a", 1, Url::parse("https://relay.example.com").unwrap());
        assert_eq!(node.authority().unwrap(), ("relay.example.com".to_string(), 443));

        let node = RelayNode::new("b", 1, Url::parse("http://[::1]:8080").unwrap());
        assert_eq!(node.authority().unwrap(), ("::1".to_string(), 8080));
    }
}
