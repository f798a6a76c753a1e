//! Engine configuration

use crate::{EngineError, OverlayPrefix};
use std::time::Duration;
use tailmesh_crypto::NodePrivate;
use tailmesh_relay::RelayMap;

/// Engine construction options
#[derive(Clone)]
pub struct Options {
    /// Name used in log spans
    pub name: String,

    /// Overlay addresses owned by this node
    pub addresses: Vec<OverlayPrefix>,

    /// Initial relay map
    pub relay_map: RelayMap,

    /// Never advertise or use direct endpoints; all traffic is relayed
    pub block_endpoints: bool,

    /// Node identity; generated when `None`
    pub node_key: Option<NodePrivate>,

    /// Underlay UDP port (0 picks a free port)
    pub listen_port: u16,

    /// Protocol timings
    pub timings: EngineTimings,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .field("regions", &self.relay_map.region_ids())
            .field("block_endpoints", &self.block_endpoints)
            .field("node_key", &self.node_key.as_ref().map(|k| k.public_key()))
            .field("listen_port", &self.listen_port)
            .field("timings", &self.timings)
            .finish()
    }
}

impl Options {
    /// Options with the given addresses and relay map; everything else
    /// defaulted.
    #[must_use]
    pub fn new(addresses: Vec<OverlayPrefix>, relay_map: RelayMap) -> Self {
        Self {
            name: "tailmesh".to_string(),
            addresses,
            relay_map,
            block_endpoints: false,
            node_key: None,
            listen_port: 0,
            timings: EngineTimings::default(),
        }
    }

    /// Set the log name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Force all traffic through relays
    #[must_use]
    pub fn with_block_endpoints(mut self, block: bool) -> Self {
        self.block_endpoints = block;
        self
    }

    /// Use a fixed identity
    #[must_use]
    pub fn with_node_key(mut self, key: NodePrivate) -> Self {
        self.node_key = Some(key);
        self
    }

    /// Bind the underlay to a fixed UDP port
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Override protocol timings
    #[must_use]
    pub fn with_timings(mut self, timings: EngineTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Check the options before construction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] if no address is given, an
    /// address lies outside the overlay range, the relay map is invalid, or a
    /// timing is out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.addresses.is_empty() {
            return Err(EngineError::construction("at least one address is required"));
        }
        if let Some(p) = self.addresses.iter().find(|p| p.addr().is_unspecified()) {
            return Err(EngineError::Construction(
                format!("address {p} is unspecified").into(),
            ));
        }
        if let Some(p) = self.addresses.iter().find(|p| !p.is_overlay()) {
            return Err(EngineError::Construction(
                format!("address {p} is outside the overlay range").into(),
            ));
        }
        self.relay_map
            .validate()
            .map_err(|e| EngineError::Construction(e.to_string().into()))?;
        self.timings.validate()
    }
}

/// Timers and thresholds of the path state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTimings {
    /// Probe interval while a session has no path
    pub negotiate_interval: Duration,
    /// Probe interval once a path is established
    pub heartbeat_interval: Duration,
    /// An established path with no pong for this long is dropped
    pub path_timeout: Duration,
    /// Consecutive direct pongs needed to leave an established relay path
    pub direct_promote_pongs: u32,
    /// Relay latency probe interval
    pub relay_health_interval: Duration,
    /// A relay that misses pongs for this long is reconnected
    pub relay_health_timeout: Duration,
    /// Bound on one relay connect and register attempt
    pub relay_connect_timeout: Duration,
    /// First relay reconnect delay
    pub reconnect_backoff_min: Duration,
    /// Reconnect delay cap
    pub reconnect_backoff_max: Duration,
    /// How often local endpoints are rediscovered
    pub endpoint_refresh_interval: Duration,
    /// How long endpoint discovery waits for STUN answers
    pub stun_timeout: Duration,
    /// Retransmission timeout for overlay stream segments
    pub stream_retransmit: Duration,
    /// Retransmissions before a stream is reset
    pub stream_max_retries: u32,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            negotiate_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(2),
            path_timeout: Duration::from_millis(6_500),
            direct_promote_pongs: 3,
            relay_health_interval: Duration::from_secs(2),
            relay_health_timeout: Duration::from_secs(5),
            relay_connect_timeout: Duration::from_secs(10),
            reconnect_backoff_min: Duration::from_millis(250),
            reconnect_backoff_max: Duration::from_secs(10),
            endpoint_refresh_interval: Duration::from_secs(30),
            stun_timeout: Duration::from_secs(2),
            stream_retransmit: Duration::from_millis(200),
            stream_max_retries: 25,
        }
    }
}

impl EngineTimings {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] for zero intervals, a zero
    /// promotion threshold, a path timeout not longer than the heartbeat, or
    /// an inverted backoff range.
    pub fn validate(&self) -> Result<(), EngineError> {
        let intervals = [
            self.negotiate_interval,
            self.heartbeat_interval,
            self.relay_health_interval,
            self.relay_connect_timeout,
            self.reconnect_backoff_min,
            self.endpoint_refresh_interval,
            self.stun_timeout,
            self.stream_retransmit,
        ];
        if intervals.iter().any(Duration::is_zero) {
            return Err(EngineError::construction("timing intervals must be non-zero"));
        }
        if self.direct_promote_pongs == 0 {
            return Err(EngineError::construction("direct_promote_pongs must be at least 1"));
        }
        if self.path_timeout <= self.heartbeat_interval {
            return Err(EngineError::construction(
                "path_timeout must exceed heartbeat_interval",
            ));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_min {
            return Err(EngineError::construction("reconnect backoff range is inverted"));
        }
        Ok(())
    }
}
