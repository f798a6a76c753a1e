//! BLAKE3 hashing and context-bound key derivation.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 key derivation bound to a context string.
///
/// Two derivations with different contexts never produce related keys even
/// when fed the same input material.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    ///
    /// # Example
    ///
    /// ```
    /// use tailmesh_crypto::hash::Kdf;
    ///
    /// let kdf = Kdf::new("tailmesh example");
    /// assert_eq!(kdf.derive_key(b"ikm"), kdf.derive_key(b"ikm"));
    /// ```
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive arbitrary-length output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }
}
