//! Node directory: the engine's view of every known peer.
//!
//! Updates arrive in batches. A batch is validated in full before anything
//! is applied, so a rejected batch leaves the directory untouched.

use crate::{EngineError, Node};
use std::collections::HashMap;
use std::net::IpAddr;
use tailmesh_crypto::NodeKey;

/// Known peers and the overlay addresses they own.
#[derive(Debug)]
pub(crate) struct Directory {
    local_key: NodeKey,
    nodes: HashMap<NodeKey, Node>,
    owners: HashMap<IpAddr, NodeKey>,
}

impl Directory {
    pub(crate) fn new(local_key: NodeKey) -> Self {
        Self {
            local_key,
            nodes: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Validate and apply a batch. Returns the resulting descriptor of every
    /// identity that was not dropped as stale, in batch order.
    pub(crate) fn apply(&mut self, batch: &[Node], replace: bool) -> Result<Vec<Node>, EngineError> {
        // Fold duplicates within the batch first.
        let mut order: Vec<NodeKey> = Vec::new();
        let mut incoming: HashMap<NodeKey, Node> = HashMap::new();
        for node in batch {
            if node.key == self.local_key {
                return Err(EngineError::InvalidNode(
                    format!("{} is the local node", node.key).into(),
                ));
            }
            if node.key.is_zero() {
                return Err(EngineError::invalid_node("node key is all zeros"));
            }
            match incoming.get_mut(&node.key) {
                Some(prev) => {
                    if !prev.addresses.is_empty()
                        && !node.addresses.is_empty()
                        && prev.addresses != node.addresses
                    {
                        return Err(EngineError::InvalidNode(
                            format!("{} appears twice with conflicting addresses", node.key).into(),
                        ));
                    }
                    prev.merge_from(node);
                }
                None => {
                    order.push(node.key);
                    incoming.insert(node.key, node.clone());
                }
            }
        }

        // Compute results without touching state.
        let mut results: Vec<Node> = Vec::with_capacity(order.len());
        let mut claimed: HashMap<IpAddr, NodeKey> = HashMap::new();
        for key in &order {
            let node = &incoming[key];
            let result = match self.nodes.get(key) {
                Some(stored) if stored.is_newer_than(node) => {
                    tracing::debug!(peer = %key.short(), stored = stored.as_of, incoming = node.as_of, "dropping stale node");
                    continue;
                }
                Some(stored) if !replace => {
                    let mut merged = stored.clone();
                    merged.merge_from(node);
                    merged
                }
                Some(_) => node.clone(),
                None => {
                    if node.addresses.is_empty() {
                        return Err(EngineError::InvalidNode(
                            format!("new node {} has no addresses", key.short()).into(),
                        ));
                    }
                    node.clone()
                }
            };
            if result.addresses.is_empty() {
                return Err(EngineError::InvalidNode(
                    format!("node {} would have no addresses", key.short()).into(),
                ));
            }
            // Anything routed to a peer must also be dialable.
            if let Some(p) = result
                .addresses
                .iter()
                .chain(&result.allowed_ips)
                .find(|p| !p.is_overlay())
            {
                return Err(EngineError::InvalidNode(
                    format!("{p} of {} is outside the overlay range", key.short()).into(),
                ));
            }

            for prefix in &result.addresses {
                let ip = prefix.addr();
                let owner = claimed.get(&ip).or_else(|| self.owners.get(&ip));
                if let Some(owner) = owner.filter(|o| *o != key) {
                    return Err(EngineError::InvalidNode(
                        format!("address {ip} already belongs to {}", owner.short()).into(),
                    ));
                }
                claimed.insert(ip, *key);
            }
            results.push(result);
        }

        for result in &results {
            self.insert(result.clone());
        }
        Ok(results)
    }

    fn insert(&mut self, node: Node) {
        if let Some(old) = self.nodes.get(&node.key) {
            for prefix in &old.addresses {
                self.owners.remove(&prefix.addr());
            }
        }
        for prefix in &node.addresses {
            self.owners.insert(prefix.addr(), node.key);
        }
        self.nodes.insert(node.key, node);
    }

    /// Remove identities; returns those that were present.
    pub(crate) fn remove(&mut self, keys: &[NodeKey]) -> Vec<NodeKey> {
        let mut removed = Vec::new();
        for key in keys {
            if let Some(node) = self.nodes.remove(key) {
                for prefix in &node.addresses {
                    self.owners.remove(&prefix.addr());
                }
                removed.push(*key);
            }
        }
        removed
    }

    /// Identity owning an overlay address.
    pub(crate) fn owner_of(&self, ip: &IpAddr) -> Option<NodeKey> {
        if let Some(key) = self.owners.get(ip) {
            return Some(*key);
        }
        self.nodes
            .values()
            .find(|n| n.owns(ip))
            .map(|n| n.key)
    }

    pub(crate) fn get(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.nodes.len()
    }
}
