//! Relay fixtures for engine tests
//!
//! Each fixture runs an in-process relay on a loopback port and hands back
//! the relay map clients should use. The relay stops when the fixture is
//! dropped.
//!
//! # Example
//!
//! ```no_run
//! use tailmesh_integration_tests::fixtures::run_relay_and_stun;
//!
//! #[tokio::test]
//! async fn test_with_relay() {
//!     let relay = run_relay_and_stun().await;
//!     let map = relay.map.clone();
//!     // ... build engines with `map` ...
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tailmesh_core::{Engine, EngineTimings, Node, Options, OverlayPrefix};
use tailmesh_relay::server::{RelayServer, RelayServerConfig};
use tailmesh_relay::stun::StunServer;
use tailmesh_relay::{RelayMap, RelayNode, RelayRegion};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

/// Generous bound for anything that should finish quickly.
pub const WAIT_SHORT: Duration = Duration::from_secs(10);

/// Bound for waits that involve a relay fallback.
pub const WAIT_MEDIUM: Duration = Duration::from_secs(15);

/// A running relay and the single-region map pointing at it
pub struct RelayFixture {
    /// Region 1 with one node on loopback
    pub map: RelayMap,
    /// Relay listen address
    pub relay_addr: SocketAddr,
    /// STUN responder address, if one runs
    pub stun_addr: Option<SocketAddr>,
    _stop: DropGuard,
}

/// Install a test log subscriber once per process; honours `RUST_LOG`.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

async fn run_relay(config: RelayServerConfig, with_stun: bool) -> RelayFixture {
    init_logging();
    let cancel = CancellationToken::new();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind relay");
    let relay_addr = server.local_addr().expect("relay address");
    tokio::spawn(server.run(cancel.clone()));

    let url = Url::parse(&format!("http://{relay_addr}")).expect("relay url");
    let mut node = RelayNode::new("1a", 1, url);
    let stun_addr = if with_stun {
        let stun = StunServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind stun");
        let addr = stun.local_addr().expect("stun address");
        tokio::spawn(stun.run(cancel.clone()));
        node = node.with_stun(addr);
        Some(addr)
    } else {
        None
    };

    let map = RelayMap::new().with_region(RelayRegion::new(1, "test", "Test").with_node(node));
    RelayFixture {
        map,
        relay_addr,
        stun_addr,
        _stop: cancel.drop_guard(),
    }
}

/// Relay accepting both upgrades plus a STUN responder.
pub async fn run_relay_and_stun() -> RelayFixture {
    run_relay(RelayServerConfig::default(), true).await
}

/// Relay that refuses `Upgrade: DERP`, forcing the WebSocket fallback.
pub async fn run_relay_only_websockets() -> RelayFixture {
    let config = RelayServerConfig {
        websocket_only: true,
        ..RelayServerConfig::default()
    };
    run_relay(config, false).await
}

/// Timings tightened for tests.
pub fn test_timings() -> EngineTimings {
    EngineTimings {
        negotiate_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(500),
        relay_health_interval: Duration::from_millis(500),
        reconnect_backoff_max: Duration::from_secs(1),
        ..EngineTimings::default()
    }
}

/// Options for one engine with a fresh overlay address.
pub fn options(name: &str, map: &RelayMap, block_endpoints: bool) -> Options {
    Options::new(vec![OverlayPrefix::random()], map.clone())
        .with_name(name)
        .with_block_endpoints(block_endpoints)
        .with_timings(test_timings())
}

/// Build an engine, panicking on failure.
pub async fn engine(name: &str, map: &RelayMap, block_endpoints: bool) -> Engine {
    Engine::new(options(name, map, block_endpoints))
        .await
        .expect("engine construction")
}

/// Forward every node `from` advertises into `to`.
pub fn forward_nodes(from: &Engine, to: &Engine) {
    let to = to.clone();
    from.set_node_callback(move |node: Node| {
        if let Err(e) = to.update_nodes(&[node], false) {
            tracing::warn!("forwarding node failed: {e}");
        }
    })
    .expect("register callback");
}

/// Register a callback that feeds nodes into a channel.
pub fn node_channel(engine: &Engine) -> tokio::sync::mpsc::UnboundedReceiver<Node> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    engine
        .set_node_callback(move |node| {
            let _ = tx.send(node);
        })
        .expect("register callback");
    rx
}
