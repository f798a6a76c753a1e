//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Sealed message shorter than nonce plus tag
    #[error("sealed message too short: {0} bytes")]
    MessageTooShort(usize),

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid public key (all-zero or low-order)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key text could not be parsed
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),
}
