//! Integrity service: content hashing, checksum tags, file verification and
//! payload signing.
//!
//! Hashing is SHA-256 everywhere. Signatures are RSA-PSS over SHA-256, using
//! a keypair that lives as long as the service.

use std::path::Path;

use rsa::RsaPrivateKey;
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{Keypair, RandomizedSigner, Verifier};
use sha2::{Digest, Sha256};

use crate::error::{VexecError, VexecResult};
use crate::types::Checksum;

/// Algorithm prefix used in checksum tags.
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Modulus size of the signing key.
pub const SIGNING_KEY_BITS: usize = 2048;

/// SHA-256 of `bytes`.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hashing and signing primitives shared by the parser and the handlers.
pub struct IntegrityService {
    signing_key: BlindedSigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
}

impl IntegrityService {
    /// Create a service with a freshly generated keypair.
    pub fn new() -> VexecResult<Self> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, SIGNING_KEY_BITS)
            .map_err(|e| VexecError::KeyGeneration(e.to_string()))?;
        let signing_key = BlindedSigningKey::<Sha256>::new(private_key);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    pub fn hash(&self, bytes: &[u8]) -> [u8; 32] {
        sha256(bytes)
    }

    pub fn hash_hex(&self, bytes: &[u8]) -> String {
        sha256_hex(bytes)
    }

    /// Algorithm-tagged checksum of `bytes`.
    pub fn checksum_tag(bytes: &[u8]) -> Checksum {
        Checksum::new(format!("{}:{}", CHECKSUM_ALGORITHM, sha256_hex(bytes)))
    }

    /// Check a declared checksum tag against `bytes`.
    ///
    /// Only the `sha256` algorithm is accepted; an unknown or missing prefix
    /// is reported as a mismatch.
    pub fn verify_checksum(declared: &Checksum, bytes: &[u8]) -> VexecResult<()> {
        let actual = Self::checksum_tag(bytes);
        let (algorithm, digest) = declared.parts();

        let matches = algorithm == Some(CHECKSUM_ALGORITHM)
            && digest.eq_ignore_ascii_case(actual.parts().1);

        if matches {
            Ok(())
        } else {
            Err(VexecError::ChecksumMismatch {
                expected: declared.to_string(),
                actual: actual.into_inner(),
            })
        }
    }

    /// Hash the file at `path` and compare it with `expected`.
    ///
    /// `expected` may carry a `sha256:` prefix. Unreadable files verify as
    /// `false`.
    pub async fn verify_file(&self, path: &Path, expected: &str) -> bool {
        let expected = expected
            .strip_prefix("sha256:")
            .unwrap_or(expected)
            .trim();

        match tokio::fs::read(path).await {
            Ok(content) => sha256_hex(&content).eq_ignore_ascii_case(expected),
            Err(e) => {
                tracing::debug!("verify_file could not read {}: {}", path.display(), e);
                false
            }
        }
    }

    /// PSS signature of `bytes` with a fresh random salt.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign_with_rng(&mut rand::rngs::OsRng, bytes)
    }

    /// Verify a signature produced by [`IntegrityService::sign`].
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.verifying_key.verify(bytes, signature).is_ok()
    }

    pub fn verifying_key(&self) -> &VerifyingKey<Sha256> {
        &self.verifying_key
    }
}
