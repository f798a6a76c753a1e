//! X25519 node keys (RFC 7748).
//!
//! Every engine owns one [`NodePrivate`]; its [`NodeKey`] is the peer's
//! identity everywhere else: relay registration, node descriptors, session
//! tables and packet headers.
//!
//! The text form of a node key is `nodekey:` followed by 64 lowercase hex
//! digits. It is what node descriptors carry in JSON.

use crate::CryptoError;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

const TEXT_PREFIX: &str = "nodekey:";

/// X25519 private key of the local node.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NodePrivate(x25519_dalek::StaticSecret);

/// X25519 public key identifying a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeKey([u8; 32]);

/// Raw X25519 shared secret. Feed through [`crate::hash::Kdf`] before use.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl NodePrivate {
    /// Generate a new random private key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Import from raw bytes (clamped per RFC 7748).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Export as raw bytes.
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Derive the public node key.
    #[must_use]
    pub fn public_key(&self) -> NodeKey {
        NodeKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Perform Diffie-Hellman with a peer's node key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the peer key is zero or a
    /// low-order point (the shared secret comes out all-zero).
    pub fn exchange(&self, peer: &NodeKey) -> Result<SharedSecret, CryptoError> {
        if peer.is_zero() {
            return Err(CryptoError::InvalidPublicKey);
        }
        let shared = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for NodePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePrivate({})", self.public_key().short())
    }
}

impl NodeKey {
    /// Wrap raw public key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Raw key bytes by value.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Whether this is the all-zero key (never a valid identity).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// First eight hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TEXT_PREFIX}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.short())
    }
}

impl FromStr for NodeKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix(TEXT_PREFIX).unwrap_or(s);
        let raw =
            hex::decode(digits).map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: raw.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            text.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

impl SharedSecret {
    /// Shared secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let private = NodePrivate::generate();
        assert!(!private.public_key().is_zero());
    }

    #[test]
    fn test_key_exchange_agrees() {
        let alice = NodePrivate::generate();
        let bob = NodePrivate::generate();

        let ab = alice.exchange(&bob.public_key()).unwrap();
        let ba = bob.exchange(&alice.public_key()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_reject_zero_key() {
        let private = NodePrivate::generate();
        assert_eq!(
            private.exchange(&NodeKey::default()).err(),
            Some(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_private_roundtrip() {
        let original = NodePrivate::generate();
        let restored = NodePrivate::from_bytes(original.to_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_text_form() {
        let key = NodeKey::from_bytes([0xab; 32]);
        let text = key.to_string();
        assert!(text.starts_with("nodekey:abab"));
        assert_eq!(text.parse::<NodeKey>().unwrap(), key);
        // Bare hex is accepted too
        assert_eq!(hex::encode([0xab; 32]).parse::<NodeKey>().unwrap(), key);
    }

    #[test]
    fn test_text_form_rejects_garbage() {
        assert!(matches!(
            "nodekey:zz".parse::<NodeKey>(),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
        assert!(matches!(
            "nodekey:abcd".parse::<NodeKey>(),
            Err(CryptoError::InvalidKeyLength { actual: 2, .. })
        ));
    }

    #[test]
    fn test_json_uses_text_form() {
        let key = NodePrivate::generate().public_key();
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("nodekey:"));
        let back: NodeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_debug_does_not_leak_private() {
        let private = NodePrivate::generate();
        let debug = format!("{private:?}");
        assert!(!debug.contains(&hex::encode(private.to_bytes())));
    }
}
