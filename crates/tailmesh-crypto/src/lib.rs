//! # tailmesh Crypto
//!
//! Cryptographic primitives shared by the tailmesh relay and engine crates.
//!
//! This crate provides:
//! - X25519 node keys ([`NodePrivate`], [`NodeKey`]) with a stable text form
//! - Per-peer `XChaCha20-Poly1305` sealing ([`PeerCipher`])
//! - BLAKE3 context-bound key derivation ([`hash::Kdf`])
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 (keyed, context string) | 128-bit |
//!
//! ## Example
//!
//! ```
//! use tailmesh_crypto::{NodePrivate, PeerCipher};
//!
//! let alice = NodePrivate::generate();
//! let bob = NodePrivate::generate();
//!
//! let a = PeerCipher::new(&alice, &bob.public_key()).unwrap();
//! let b = PeerCipher::new(&bob, &alice.public_key()).unwrap();
//!
//! let sealed = a.seal(b"ping", b"hdr").unwrap();
//! assert_eq!(b.open(&sealed, b"hdr").unwrap(), b"ping");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod key;

pub use aead::PeerCipher;
pub use error::CryptoError;
pub use key::{NodeKey, NodePrivate};

/// X25519 public key size
pub const NODE_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;
