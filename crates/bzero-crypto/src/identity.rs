//! Agent identity keys.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::{CryptoError, CryptoResult};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// The agent's Ed25519 identity key pair.
///
/// Generated once at registration and persisted (base64) in the durable
/// config; never rotated by this subsystem.
#[derive(Clone)]
pub struct IdentityKeypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeypair {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Rebuild from the base64 private key stored in the agent config.
    pub fn from_base64(private_key: &str) -> CryptoResult<Self> {
        let bytes = B64
            .decode(private_key)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        // Legacy configs stored the 64-byte dalek keypair; current ones store
        // the 32-byte seed. Accept both.
        let seed: [u8; 32] = match bytes.len() {
            32 => bytes.as_slice().try_into().unwrap(),
            64 => bytes[..32].try_into().unwrap(),
            n => {
                return Err(CryptoError::InvalidKeyFormat(format!(
                    "expected 32 or 64 key bytes, got {}",
                    n
                )))
            }
        };
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Base64 private key for persistence in the agent config.
    pub fn private_key_base64(&self) -> String {
        B64.encode(self.signing_key.to_bytes())
    }

    /// Base64 public key as published to the bastion.
    pub fn public_key_base64(&self) -> String {
        B64.encode(self.verifying_key.as_bytes())
    }

    /// Sign arbitrary bytes, returning the base64 signature the bastion
    /// endpoints expect.
    pub fn sign_base64(&self, message: &[u8]) -> String {
        B64.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Solve a bastion nonce challenge.
    pub fn solve_challenge(&self, nonce: &str) -> String {
        self.sign_base64(nonce.as_bytes())
    }

    /// Verify a base64 signature against this identity's public key.
    pub fn verify_base64(&self, message: &[u8], signature: &str) -> CryptoResult<()> {
        let bytes = B64
            .decode(signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))?;
        let sig = Signature::from_slice(&bytes).map_err(|e| CryptoError::Signature(e.to_string()))?;
        self.verifying_key
            .verify(message, &sig)
            .map_err(|e| CryptoError::Signature(e.to_string()))
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_roundtrip() {
        let keypair = IdentityKeypair::generate();
        let restored = IdentityKeypair::from_base64(&keypair.private_key_base64()).unwrap();
        assert_eq!(keypair.public_key_base64(), restored.public_key_base64());
    }

    #[test]
    fn test_sign_verify() {
        let keypair = IdentityKeypair::generate();
        let sig = keypair.sign_base64(b"nonce-bytes");
        keypair.verify_base64(b"nonce-bytes", &sig).unwrap();
        assert!(keypair.verify_base64(b"other-bytes", &sig).is_err());
    }

    #[test]
    fn test_accepts_legacy_64_byte_key() {
        let keypair = IdentityKeypair::generate();
        let mut legacy = B64.decode(keypair.private_key_base64()).unwrap();
        legacy.extend_from_slice(keypair.verifying_key.as_bytes());
        let restored = IdentityKeypair::from_base64(&B64.encode(&legacy)).unwrap();
        assert_eq!(keypair.public_key_base64(), restored.public_key_base64());
    }
}
