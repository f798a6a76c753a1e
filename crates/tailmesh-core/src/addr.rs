//! Overlay address space.
//!
//! Every node owns addresses inside the unique-local prefix
//! `fd7a:115c:a1e0::/48`. The remaining 80 bits are random, so engines in
//! the same process (or on the same network) do not collide in practice.
//!
//! ```text
//!  0        16       32       48                                  128
//!  ├────────┼────────┼────────┼───────────────────────────────────┤
//!  │  fd7a  │  115c  │  a1e0  │        80 random bits              │
//!  └────────┴────────┴────────┴───────────────────────────────────┘
//! ```

use crate::EngineError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

/// First 48 bits of every overlay address.
pub const OVERLAY_PREFIX: [u8; 6] = [0xfd, 0x7a, 0x11, 0x5c, 0xa1, 0xe0];

/// Length of [`OVERLAY_PREFIX`] in bits.
pub const OVERLAY_PREFIX_BITS: u8 = 48;

/// Draw a fresh random overlay address.
#[must_use]
pub fn allocate_local_address() -> IpAddr {
    let mut octets = [0u8; 16];
    octets[..6].copy_from_slice(&OVERLAY_PREFIX);
    rand::thread_rng().fill_bytes(&mut octets[6..]);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Whether `ip` falls inside the overlay prefix.
#[must_use]
pub fn is_overlay_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.octets()[..6] == OVERLAY_PREFIX,
        IpAddr::V4(_) => false,
    }
}

/// An address plus prefix length, e.g. `fd7a:115c:a1e0::1/128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlayPrefix {
    addr: IpAddr,
    bits: u8,
}

impl OverlayPrefix {
    /// Create a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAddress`] if `bits` exceeds the address
    /// width.
    pub fn new(addr: IpAddr, bits: u8) -> Result<Self, EngineError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(EngineError::InvalidAddress(format!("{addr}/{bits}")));
        }
        Ok(Self { addr, bits })
    }

    /// Single-host prefix (`/32` or `/128`).
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        let bits = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, bits }
    }

    /// Freshly allocated overlay host prefix.
    #[must_use]
    pub fn random() -> Self {
        Self::host(allocate_local_address())
    }

    /// The address part.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Whether the whole prefix lies inside the overlay range.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        self.bits >= OVERLAY_PREFIX_BITS && is_overlay_address(&self.addr)
    }

    /// Whether `ip` is inside this prefix.
    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.bits)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.bits)).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for OverlayPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

impl FromStr for OverlayPrefix {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidAddress(s.to_string());
        match s.split_once('/') {
            Some((addr, bits)) => {
                let addr = addr.parse::<IpAddr>().map_err(|_| invalid())?;
                let bits = bits.parse::<u8>().map_err(|_| invalid())?;
                Self::new(addr, bits)
            }
            None => Ok(Self::host(s.parse::<IpAddr>().map_err(|_| invalid())?)),
        }
    }
}

impl Serialize for OverlayPrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OverlayPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_address_in_prefix() {
        let ip = allocate_local_address();
        assert!(is_overlay_address(&ip));
        let net = OverlayPrefix::new("fd7a:115c:a1e0::".parse().unwrap(), OVERLAY_PREFIX_BITS)
            .unwrap();
        assert!(net.contains(&ip));
    }

    #[test]
    fn test_allocations_differ() {
        assert_ne!(allocate_local_address(), allocate_local_address());
    }

    #[test]
    fn test_parse_and_display() {
        let p: OverlayPrefix = "fd7a:115c:a1e0::5/128".parse().unwrap();
        assert_eq!(p.bits(), 128);
        assert_eq!(p.to_string(), "fd7a:115c:a1e0::5/128");

        let bare: OverlayPrefix = "10.0.0.1".parse().unwrap();
        assert_eq!(bare.bits(), 32);

        assert!("fd7a::/129".parse::<OverlayPrefix>().is_err());
        assert!("nonsense/8".parse::<OverlayPrefix>().is_err());
    }

    #[test]
    fn test_contains() {
        let p: OverlayPrefix = "10.1.0.0/16".parse().unwrap();
        assert!(p.contains(&"10.1.200.3".parse().unwrap()));
        assert!(!p.contains(&"10.2.0.1".parse().unwrap()));
        assert!(!p.contains(&"fd7a::1".parse().unwrap()));

        let all: OverlayPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(&"192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_not_overlay() {
        assert!(!is_overlay_address(&"127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_inside_overlay() {
        assert!(OverlayPrefix::random().is_overlay());
        assert!("fd7a:115c:a1e0:5::/64".parse::<OverlayPrefix>().unwrap().is_overlay());
        assert!(!"fd7a:115c:a1e0::/32".parse::<OverlayPrefix>().unwrap().is_overlay());
        assert!(!"10.77.0.1/32".parse::<OverlayPrefix>().unwrap().is_overlay());
    }

    #[test]
    fn test_serde_string_form() {
        let p = OverlayPrefix::host("fd7a:115c:a1e0::9".parse().unwrap());
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"fd7a:115c:a1e0::9/128\"");
        assert_eq!(serde_json::from_str::<OverlayPrefix>(&json).unwrap(), p);
    }
}
