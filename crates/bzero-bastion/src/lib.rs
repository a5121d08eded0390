//! BastionZero Bastion Integration - everything that talks HTTP to the
//! coordinator
//!
//! - [`BastionClient`] — the REST surface: error/restart reports, log
//!   upload, certificate co-signing, identity tokens, nonce challenges.
//! - [`IdentityProvider`] — caches the agent identity token, re-verifying
//!   it against the bastion JWKS and refreshing with an Ed25519-signed
//!   request when it goes stale.
//! - [`archive`] — builds the `archive.zip` that rides the log upload.

pub mod archive;
pub mod client;
pub mod identity;

pub use client::{BastionClient, CoSignCertificateRequest};
pub use identity::{IdentityProvider, TokenVerifier};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BastionError {
    #[error("bastion request failed: {0}")]
    Request(String),

    #[error("bastion returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("identity token refresh failed: {0}")]
    Identity(String),

    #[error("log archive failed: {0}")]
    Archive(String),
}

pub type BastionResult<T> = Result<T, BastionError>;
