//! # tailmesh Core
//!
//! Overlay networking engine: peers get stable overlay addresses and talk
//! over direct encrypted UDP paths when they can, falling back to relays
//! (native `Upgrade: DERP`, or WebSocket when a proxy rejects it).
//!
//! This crate provides:
//! - Overlay address allocation ([`allocate_local_address`], [`OverlayPrefix`])
//! - Peer descriptors and the node directory ([`Node`], [`Engine::update_nodes`])
//! - A relay client pool with preferred-region selection
//! - Per-peer path negotiation with relay-to-direct promotion ([`PeerStatus`])
//! - Reliable overlay streams ([`Engine::listen`], [`Engine::dial_tcp`])
//! - Reachability waits ([`Engine::await_reachable`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Transport / Reachability                        │
//! │   (listen, dial, await_reachable on overlay addresses)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Connectivity Engine                         │
//! │   (sessions: Negotiating → Direct / Relay established)          │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │      Node Directory          │       Relay Client Pool          │
//! │  (merge / replace, as_of)    │  (one worker per region)         │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Node descriptors travel between peers out of band: register a callback
//! with [`Engine::set_node_callback`] and feed what arrives from peers into
//! [`Engine::update_nodes`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
mod callback;
pub mod config;
mod directory;
mod engine;
pub mod error;
mod magicsock;
mod netstack;
pub mod node;
mod reachability;
mod relay_pool;
pub mod session;
mod transport;

pub use addr::{OverlayPrefix, allocate_local_address, is_overlay_address};
pub use callback::NodeCallback;
pub use config::{EngineTimings, Options};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use node::{Endpoint, EndpointSource, Node};
pub use session::{MAX_PROBES_PER_ROUND, PathKind, PeerStatus, SessionState};
pub use transport::{OverlayListener, OverlayStream};
