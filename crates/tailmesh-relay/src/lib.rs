//! # DERP-Style Relay
//!
//! Relay infrastructure for peers that cannot reach each other directly.
//! A relay forwards opaque, end-to-end encrypted packets between registered
//! node keys; it never sees plaintext.
//!
//! ## Features
//!
//! - Relay map of numbered regions ([`map`])
//! - Length-prefixed bincode wire protocol ([`protocol`])
//! - Native `Upgrade: DERP` transport with automatic WebSocket fallback when
//!   an intermediary rejects the native upgrade ([`client`])
//! - Relay server accepting both transports, optionally WebSocket-only ([`server`])
//! - STUN binding responder for endpoint discovery ([`stun`])
//! - Deterministic preferred-region selection ([`selection`])
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │  Relay Region 1 │
//!                    │  GET /derp      │
//!                    └────────┬────────┘
//!                             │  Upgrade: DERP
//!              ┌──────────────┴──────────────┐  (or Upgrade: websocket)
//!              │                              │
//!              ▼                              ▼
//!       ┌─────────────┐                ┌─────────────┐
//!       │   Peer A    │                │   Peer B    │
//!       │  (NAT'd)    │                │  (proxied)  │
//!       └─────────────┘                └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tailmesh_crypto::NodePrivate;
//! use tailmesh_relay::client::{ConnectOptions, RelayClient};
//! use tailmesh_relay::map::RelayMap;
//!
//! # async fn example(map: RelayMap) -> Result<(), Box<dyn std::error::Error>> {
//! let private = NodePrivate::generate();
//! let region = map.region(1).ok_or("no region 1")?;
//!
//! let client = RelayClient::connect(&region.nodes[0], &private, &ConnectOptions::default()).await?;
//! if let Some(reason) = client.forced_websocket() {
//!     println!("tunnelled over WebSocket: {reason}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod http;
pub mod map;
pub mod protocol;
pub mod selection;
pub mod server;
pub mod stun;
pub mod websocket;

pub use error::RelayError;
pub use map::{RegionId, RelayMap, RelayNode, RelayRegion};

/// HTTP path relay clients upgrade on.
pub const RELAY_PATH: &str = "/derp";

/// Protocol token sent in the native `Upgrade` header.
pub const NATIVE_UPGRADE: &str = "DERP";

/// WebSocket sub-protocol carrying the relay protocol.
pub const WEBSOCKET_PROTOCOL: &str = "derp";

/// Maximum relay packet payload size (64 KB)
pub const MAX_RELAY_PACKET_SIZE: usize = 65536;

/// Relay keepalive interval (30 seconds)
pub const RELAY_KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Relay connection timeout (10 seconds)
pub const RELAY_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
