//! Per-connection ephemeral client keys.

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{CryptoError, CryptoResult};

/// An RSA 2048 keypair generated for a single database connection.
///
/// The private half lives only as long as the session: it is handed to the
/// TLS client config and dropped with it, and there is deliberately no
/// serialization path to any backend.
pub struct EphemeralKey {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl EphemeralKey {
    pub const BITS: usize = 2048;

    pub fn generate() -> CryptoResult<Self> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, Self::BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// SubjectPublicKeyInfo DER, as embedded in the certificate template.
    pub fn public_key_der(&self) -> CryptoResult<Vec<u8>> {
        Ok(self
            .public_key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// SubjectPublicKeyInfo PEM, as sent to the cosign endpoint.
    pub fn public_key_pem(&self) -> CryptoResult<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
    }

    /// PKCS#8 DER of the private key, consumed by the TLS client config.
    pub fn private_key_pkcs8_der(&self) -> CryptoResult<Vec<u8>> {
        Ok(self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey").finish_non_exhaustive()
    }
}
