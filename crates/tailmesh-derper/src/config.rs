//! Configuration file for the relay server.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tailmesh_relay::server::RelayServerConfig;
use tailmesh_relay::RegionId;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Relay listener
    #[serde(default)]
    pub relay: RelayConfig,
    /// STUN responder
    #[serde(default)]
    pub stun: StunConfig,
    /// Region advertised in the printed relay map
    #[serde(default)]
    pub region: RegionConfig,
}

/// Relay listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Listen address
    #[serde(default = "default_relay_addr")]
    pub listen_addr: SocketAddr,
    /// Host clients use in the relay URL; defaults to the listen IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Refuse `Upgrade: DERP`, accept only WebSocket
    #[serde(default)]
    pub websocket_only: bool,
    /// Maximum concurrent clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Packets per client per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Idle client timeout in seconds
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

/// STUN responder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StunConfig {
    /// Run the responder
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listen address
    #[serde(default = "default_stun_addr")]
    pub listen_addr: SocketAddr,
}

/// Advertised region
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionConfig {
    /// Region id
    #[serde(default = "default_region_id")]
    pub id: RegionId,
    /// Short region code
    #[serde(default = "default_region_code")]
    pub code: String,
    /// Human readable name
    #[serde(default = "default_region_name")]
    pub name: String,
}

// Default values

fn default_relay_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3340))
}

fn default_stun_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3478))
}

fn default_max_clients() -> usize {
    RelayServerConfig::default().max_clients
}

fn default_rate_limit() -> usize {
    RelayServerConfig::default().rate_limit
}

fn default_client_timeout() -> u64 {
    RelayServerConfig::default().client_timeout.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_region_id() -> RegionId {
    1
}

fn default_region_code() -> String {
    "local".to_string()
}

fn default_region_name() -> String {
    "Local".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_relay_addr(),
            hostname: None,
            websocket_only: false,
            max_clients: default_max_clients(),
            rate_limit: default_rate_limit(),
            client_timeout_secs: default_client_timeout(),
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_stun_addr(),
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            id: default_region_id(),
            code: default_region_code(),
            name: default_region_name(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.region.id == 0 {
            anyhow::bail!("region id 0 is reserved");
        }
        if self.relay.max_clients == 0 {
            anyhow::bail!("max_clients must be positive");
        }
        if self.relay.rate_limit == 0 {
            anyhow::bail!("rate_limit must be positive");
        }
        if self.relay.client_timeout_secs == 0 {
            anyhow::bail!("client_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Server settings for [`tailmesh_relay::server::RelayServer`]
    #[must_use]
    pub fn server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_clients: self.relay.max_clients,
            rate_limit: self.relay.rate_limit,
            client_timeout: Duration::from_secs(self.relay.client_timeout_secs),
            websocket_only: self.relay.websocket_only,
            ..RelayServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.listen_addr.port(), 3340);
        assert!(config.stun.enabled);
        assert_eq!(config.region.id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[relay]\nwebsocket_only = true\n\n[region]\nid = 7\ncode = \"fra\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.relay.websocket_only);
        assert_eq!(config.relay.rate_limit, default_rate_limit());
        assert_eq!(config.region.id, 7);
        assert_eq!(config.region.name, "Local");
        assert!(config.server_config().websocket_only);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_region() {
        let mut config = Config::default();
        config.region.id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/derper.toml").unwrap_err();
        assert!(err.to_string().contains("derper.toml"));
    }
}
