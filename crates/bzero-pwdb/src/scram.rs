//! SCRAM-SHA-256 client (RFC 5802 over SHA-256), as PostgreSQL speaks it.
//!
//! PostgreSQL carries the username in the startup packet, so the SCRAM
//! `n=` attribute stays empty. Channel binding is not offered (`n,,`).

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{PwdbError, PwdbResult};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const GS2_HEADER: &str = "n,,";
const NONCE_LEN: usize = 24;

/// Client state machine: `client_first` → `handle_server_first` →
/// `verify_server_final`, strictly in that order.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: Option<String>,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let client_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(password, client_nonce)
    }

    pub(crate) fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            client_first_bare: None,
            auth_message: None,
            salted_password: None,
        }
    }

    /// `n,,n=,r=<client-nonce>`
    pub fn client_first(&mut self) -> String {
        let bare = format!("n=,r={}", self.client_nonce);
        let full = format!("{}{}", GS2_HEADER, bare);
        self.client_first_bare = Some(bare);
        full
    }

    /// Consume `r=...,s=...,i=...` and produce the client-final message
    /// carrying the proof.
    pub fn handle_server_first(&mut self, server_first: &str) -> PwdbResult<String> {
        let bare = self
            .client_first_bare
            .as_ref()
            .ok_or_else(|| PwdbError::Scram("client-first not sent yet".into()))?;

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for chunk in server_first.split(',') {
            if let Some(v) = chunk.strip_prefix("r=") {
                server_nonce = Some(v.to_string());
            } else if let Some(v) = chunk.strip_prefix("s=") {
                salt = Some(
                    B64.decode(v)
                        .map_err(|_| PwdbError::Scram("invalid salt".into()))?,
                );
            } else if let Some(v) = chunk.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| PwdbError::Scram("invalid iteration count".into()))?,
                );
            }
        }
        let server_nonce = server_nonce.ok_or_else(|| PwdbError::Scram("missing nonce".into()))?;
        let salt = salt.ok_or_else(|| PwdbError::Scram("missing salt".into()))?;
        let iterations = iterations.ok_or_else(|| PwdbError::Scram("missing iterations".into()))?;

        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(PwdbError::Scram("server nonce does not extend ours".into()));
        }
        if iterations == 0 {
            return Err(PwdbError::Scram("zero iteration count".into()));
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let channel_binding = B64.encode(GS2_HEADER.as_bytes());
        let without_proof = format!("c={},r={}", channel_binding, server_nonce);
        let auth_message = format!("{},{},{}", bare, server_first, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);
        Ok(format!("{},p={}", without_proof, B64.encode(proof)))
    }

    /// Check the server's `v=<signature>` (or surface its `e=`).
    pub fn verify_server_final(&self, server_final: &str) -> PwdbResult<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(PwdbError::Scram(err.to_string()));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .and_then(|v| B64.decode(v).ok())
            .ok_or_else(|| PwdbError::Scram("malformed server-final".into()))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| PwdbError::Scram("client-final not sent yet".into()))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| PwdbError::Scram("client-final not sent yet".into()))?;

        let server_key = hmac(&salted_password, b"Server Key");
        let expected = hmac(&server_key, auth_message.as_bytes());
        if expected.as_slice() != verifier.as_slice() {
            return Err(PwdbError::Scram("server signature mismatch".into()));
        }
        Ok(())
    }
}

/// `Hi(str, salt, i)` — PBKDF2-HMAC-SHA-256 with one block.
pub(crate) fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(password).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);
    let mut prev: [u8; 32] = mac.finalize().into_bytes().into();
    let mut out = prev;
    for _ in 1..iterations {
        let mut mac = Hmac::<Sha256>::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(&prev);
        prev = mac.finalize().into_bytes().into();
        for (o, p) in out.iter_mut().zip(prev) {
            *o ^= p;
        }
    }
    out
}

pub(crate) fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Server-side SCRAM arithmetic, mirroring what a real PostgreSQL backend
/// computes. Test-only: drives the client from fake servers.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) struct ReferenceServer {
        pub salt: Vec<u8>,
        pub iterations: u32,
        pub server_nonce_suffix: String,
        salted_password: [u8; 32],
        auth_message: Option<String>,
    }

    impl ReferenceServer {
        pub fn new(password: &str, salt: &[u8], iterations: u32) -> Self {
            Self {
                salt: salt.to_vec(),
                iterations,
                server_nonce_suffix: "srvnonce1234".into(),
                salted_password: hi(password.as_bytes(), salt, iterations),
                auth_message: None,
            }
        }

        pub fn server_first(&self, client_first: &str) -> String {
            let client_nonce = client_first
                .split(',')
                .find_map(|c| c.strip_prefix("r="))
                .unwrap();
            format!(
                "r={}{},s={},i={}",
                client_nonce,
                self.server_nonce_suffix,
                B64.encode(&self.salt),
                self.iterations
            )
        }

        /// Verify the client proof; on success return `v=...`.
        pub fn handle_client_final(
            &mut self,
            client_first: &str,
            server_first: &str,
            client_final: &str,
        ) -> Result<String, String> {
            let bare = client_first.strip_prefix(GS2_HEADER).unwrap();
            let without_proof = client_final
                .rsplit_once(",p=")
                .map(|(head, _)| head)
                .ok_or("missing proof")?;
            let auth_message = format!("{},{},{}", bare, server_first, without_proof);

            let proof = client_final
                .rsplit_once("p=")
                .and_then(|(_, p)| B64.decode(p).ok())
                .ok_or("undecodable proof")?;

            let client_key = hmac(&self.salted_password, b"Client Key");
            let stored_key: [u8; 32] = Sha256::digest(client_key).into();
            let client_signature = hmac(&stored_key, auth_message.as_bytes());
            let candidate: Vec<u8> = proof
                .iter()
                .zip(client_signature)
                .map(|(p, s)| p ^ s)
                .collect();
            if candidate != client_key.to_vec() {
                return Err("proof mismatch".into());
            }

            self.auth_message = Some(auth_message.clone());
            let server_key = hmac(&self.salted_password, b"Server Key");
            Ok(format!("v={}", B64.encode(hmac(&server_key, auth_message.as_bytes()))))
        }
    }
}
