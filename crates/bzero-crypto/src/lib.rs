//! BastionZero Crypto - key material for the zero-trust access plane
//!
//! Three families of keys live here, with very different lifetimes:
//!
//! - [`IdentityKeypair`] — the agent's Ed25519 identity, generated at
//!   registration and persisted in the durable config for the life of the
//!   target.
//! - [`EphemeralKey`] — an RSA 2048 keypair generated per database
//!   connection and dropped when the connection closes. Never persisted.
//! - [`SplitPrivateKey`] — one of two additive RSA key shares. Signing the
//!   same message under both shares and multiplying the results yields a
//!   valid signature under the CA public key; neither holder ever sees a
//!   complete private key.
//!
//! The [`cert`] module builds the X.509 client-certificate template that the
//! split shares co-sign.

pub mod cert;
mod der;
pub mod ephemeral;
pub mod identity;
pub mod split;

pub use cert::{ClientCertificateRequest, SplitClientCertificate};
pub use ephemeral::EphemeralKey;
pub use identity::IdentityKeypair;
pub use split::SplitPrivateKey;

use thiserror::Error;

/// Errors from key handling and certificate construction.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    #[error("certificate parse failure: {0}")]
    CertificateParse(String),

    #[error("key generation failure: {0}")]
    KeyGeneration(String),

    #[error("signature failure: {0}")]
    Signature(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
