//! tailmesh relay server
//!
//! Runs a DERP-style relay (native and WebSocket upgrades) plus an optional
//! STUN responder, and prints the relay map JSON clients should load.

mod config;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tailmesh_relay::server::RelayServer;
use tailmesh_relay::stun::StunServer;
use tailmesh_relay::{RelayMap, RelayNode, RelayRegion};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use config::Config;

/// tailmesh relay and STUN server
#[derive(Parser, Debug)]
#[command(name = "tailmesh-derper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Host name advertised in the relay URL
    #[arg(long)]
    hostname: Option<String>,

    /// Only accept WebSocket upgrades
    #[arg(long)]
    websocket_only: bool,

    /// STUN listen address
    #[arg(long)]
    stun_listen: Option<SocketAddr>,

    /// Disable the STUN responder
    #[arg(long)]
    no_stun: bool,

    /// Advertised region id
    #[arg(long)]
    region_id: Option<u16>,
}

impl Cli {
    /// Command-line flags take precedence over the file.
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.listen {
            config.relay.listen_addr = addr;
        }
        if let Some(host) = &self.hostname {
            config.relay.hostname = Some(host.clone());
        }
        if self.websocket_only {
            config.relay.websocket_only = true;
        }
        if let Some(addr) = self.stun_listen {
            config.stun.listen_addr = addr;
        }
        if self.no_stun {
            config.stun.enabled = false;
        }
        if let Some(id) = self.region_id {
            config.region.id = id;
        }
    }
}

/// Relay map describing this server as seen by clients.
fn relay_map(config: &Config, relay: SocketAddr, stun: Option<SocketAddr>) -> anyhow::Result<RelayMap> {
    let host = match &config.relay.hostname {
        Some(host) => host.clone(),
        None if relay.ip().is_unspecified() => "127.0.0.1".to_string(),
        None if relay.is_ipv6() => format!("[{}]", relay.ip()),
        None => relay.ip().to_string(),
    };
    let url = Url::parse(&format!("http://{host}:{}", relay.port()))
        .with_context(|| format!("building relay URL from host {host:?}"))?;

    let mut node = RelayNode::new(
        format!("{}a", config.region.id),
        config.region.id,
        url,
    );
    if let Some(stun) = stun {
        let ip = if stun.ip().is_unspecified() { relay.ip() } else { stun.ip() };
        let ip = if ip.is_unspecified() { [127, 0, 0, 1].into() } else { ip };
        node = node.with_stun(SocketAddr::new(ip, stun.port()));
    }
    let region = RelayRegion::new(config.region.id, &config.region.code, &config.region.name).with_node(node);
    Ok(RelayMap::new().with_region(region))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let server = RelayServer::bind(config.relay.listen_addr, config.server_config())
        .await
        .with_context(|| format!("binding relay on {}", config.relay.listen_addr))?;
    let relay_addr = server.local_addr()?;
    tracing::info!(
        addr = %relay_addr,
        websocket_only = config.relay.websocket_only,
        "relay listening"
    );
    tracker.spawn(server.run(cancel.clone()));

    let stun_addr = if config.stun.enabled {
        let stun = StunServer::bind(config.stun.listen_addr)
            .await
            .with_context(|| format!("binding STUN on {}", config.stun.listen_addr))?;
        let addr = stun.local_addr()?;
        tracing::info!(%addr, "STUN listening");
        tracker.spawn(stun.run(cancel.clone()));
        Some(addr)
    } else {
        None
    };

    let map = relay_map(&config, relay_addr, stun_addr)?;
    println!("{}", map.to_json()?);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::parse_from([
            "tailmesh-derper",
            "--listen",
            "127.0.0.1:4000",
            "--websocket-only",
            "--no-stun",
            "--region-id",
            "9",
        ]);
        let mut config = Config::default();
        config.region.code = "fra".into();
        cli.apply(&mut config);
        assert_eq!(config.relay.listen_addr.port(), 4000);
        assert!(config.relay.websocket_only);
        assert!(!config.stun.enabled);
        assert_eq!(config.region.id, 9);
        assert_eq!(config.region.code, "fra");
    }

    #[test]
    fn test_relay_map_for_unspecified_listen() {
        let config = Config::default();
        let map = relay_map(
            &config,
            "0.0.0.0:3340".parse().unwrap(),
            Some("0.0.0.0:3478".parse().unwrap()),
        )
        .unwrap();
        let node = &map.region(1).unwrap().nodes[0];
        assert_eq!(node.url.as_str(), "http://127.0.0.1:3340/");
        assert_eq!(node.stun_addr, Some("127.0.0.1:3478".parse().unwrap()));
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_relay_map_hostname() {
        let mut config = Config::default();
        config.relay.hostname = Some("derp.example.com".into());
        let map = relay_map(&config, "10.0.0.1:443".parse().unwrap(), None).unwrap();
        let node = &map.region(1).unwrap().nodes[0];
        assert_eq!(node.url.host_str(), Some("derp.example.com"));
        assert!(node.stun_addr.is_none());
    }

    #[test]
    fn test_verbose_count() {
        let cli = Cli::parse_from(["tailmesh-derper", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }
}
