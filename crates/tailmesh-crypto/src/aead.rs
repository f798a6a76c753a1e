//! `XChaCha20-Poly1305` sealing between two nodes.
//!
//! Both ends of a peer pair derive the same symmetric key from their X25519
//! shared secret. Every sealed message carries its own random 192-bit nonce,
//! so messages may travel over different paths (direct UDP, any relay region)
//! and arrive in any order.
//!
//! ## Wire layout
//!
//! ```text
//! +----------------+----------------------------------+
//! | nonce (24 B)   | ciphertext || tag (len + 16 B)   |
//! +----------------+----------------------------------+
//! ```

use crate::hash::Kdf;
use crate::key::{NodeKey, NodePrivate};
use crate::{CryptoError, TAG_SIZE, XCHACHA_NONCE_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// KDF context for peer-to-peer packet keys.
const PEER_KEY_CONTEXT: &str = "tailmesh 2024-06 peer packet key";

/// AEAD key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
struct AeadKey([u8; 32]);

/// Symmetric cipher shared by one pair of nodes.
#[derive(Clone)]
pub struct PeerCipher {
    key: AeadKey,
    peer: NodeKey,
}

impl PeerCipher {
    /// Derive the pair cipher from our private key and the peer's node key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the peer key is unusable.
    pub fn new(local: &NodePrivate, peer: &NodeKey) -> Result<Self, CryptoError> {
        let shared = local.exchange(peer)?;
        let key = Kdf::new(PEER_KEY_CONTEXT).derive_key(shared.as_bytes());
        Ok(Self {
            key: AeadKey(key),
            peer: *peer,
        })
    }

    /// The remote node this cipher talks to.
    #[must_use]
    pub fn peer(&self) -> NodeKey {
        self.peer
    }

    /// Seal `plaintext`, authenticating `aad` alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.key.0).into());
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(XCHACHA_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a message produced by [`PeerCipher::seal`] on the other side.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MessageTooShort`] for truncated input and
    /// [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < XCHACHA_NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MessageTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(XCHACHA_NONCE_SIZE);

        let cipher = XChaCha20Poly1305::new((&self.key.0).into());
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PeerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCipher").field("peer", &self.peer).finish()
    }
}
