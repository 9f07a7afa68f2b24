//! Credential Verifier
//!
//! Guards the RPC interface with a single shared access token. Only the
//! SHA-256 digest of the token is kept; presented tokens are hashed and
//! compared in constant time.

use std::fmt;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of a token digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// One-way digest of the access token.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenDigest([u8; DIGEST_LEN]);

/// Errors building a digest from its hex form.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("token digest is not valid hex")]
    InvalidHex,

    #[error("token digest must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

impl TokenDigest {
    /// Hash a plaintext token.
    pub fn of(token: &str) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&Sha256::digest(token.as_bytes()));
        Self(out)
    }

    /// Parse a hex-encoded digest as stored in configuration.
    pub fn from_hex(encoded: &str) -> Result<Self, DigestError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| DigestError::InvalidHex)?;
        if bytes.len() != DIGEST_LEN {
            return Err(DigestError::WrongLength {
                expected: DIGEST_LEN,
                actual: bytes.len(),
            });
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Hex encoding, for provisioning tools and config files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison against another digest.
    fn matches(&self, other: &TokenDigest) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenDigest([REDACTED])")
    }
}

/// Verifies presented tokens against the stored digest.
///
/// The digest can be rotated while connections are being authenticated;
/// every verification runs against exactly one digest value.
pub struct CredentialVerifier {
    digest: RwLock<Arc<TokenDigest>>,
}

impl CredentialVerifier {
    /// Create a verifier for the given digest.
    pub fn new(digest: TokenDigest) -> Self {
        Self {
            digest: RwLock::new(Arc::new(digest)),
        }
    }

    /// Returns true iff the digest of `presented` equals the stored digest.
    pub fn verify(&self, presented: &str) -> bool {
        let candidate = TokenDigest::of(presented);
        self.current().matches(&candidate)
    }

    /// Replace the stored digest.
    pub fn rotate(&self, digest: TokenDigest) {
        let next = Arc::new(digest);
        match self.digest.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!("access token digest rotated");
    }

    fn current(&self) -> Arc<TokenDigest> {
        match self.digest.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

impl fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_matching_token() {
        let verifier = CredentialVerifier::new(TokenDigest::of("abc123"));
        assert!(verifier.verify("abc123"));
    }

    #[test]
    fn test_verify_rejects_other_tokens() {
        let verifier = CredentialVerifier::new(TokenDigest::of("abc123"));
        assert!(!verifier.verify("abc124"));
        assert!(!verifier.verify(""));
        assert!(!verifier.verify("abc123 "));
    }

    #[test]
    fn test_from_hex_round_trips_known_digest() {
        // sha256("abc123")
        let hex = "6ca13d52ca70c883e0f0bb101e425a89e8624de51db2d2392593af6a84118090";
        let digest = TokenDigest::from_hex(hex).unwrap();
        assert_eq!(digest, TokenDigest::of("abc123"));
        assert_eq!(digest.to_hex(), hex);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(TokenDigest::from_hex("zz"), Err(DigestError::InvalidHex)));
        assert!(matches!(
            TokenDigest::from_hex("abcd"),
            Err(DigestError::WrongLength { expected: 32, actual: 2 })
        ));
    }

    #[test]
    fn test_rotation_replaces_digest() {
        let verifier = CredentialVerifier::new(TokenDigest::of("old"));
        verifier.rotate(TokenDigest::of("new"));
        assert!(!verifier.verify("old"));
        assert!(verifier.verify("new"));
    }

    #[test]
    fn test_debug_does_not_leak_digest() {
        let digest = TokenDigest::of("abc123");
        let debug = format!("{:?}", digest);
        assert!(!debug.contains(&digest.to_hex()[..8]));
    }
}
