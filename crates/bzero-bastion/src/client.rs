//! The bastion REST client.

use std::collections::HashMap;

use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{BastionError, BastionResult};

/// Client for the `/api/v2` agent surface. Every authenticated call
/// attaches `Authorization: Bearer <agent-identity-token>`.
pub struct BastionClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    #[serde(rename = "Reporter")]
    reporter: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "Message")]
    message: &'a str,
    #[serde(rename = "State")]
    state: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct RestartReport<'a> {
    #[serde(rename = "TargetId")]
    target_id: &'a str,
    #[serde(rename = "AgentPublicKey")]
    agent_public_key: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "Message")]
    message: &'a str,
    #[serde(rename = "State")]
    state: &'a HashMap<String, String>,
}

/// Body of `/api/v2/certificate/cosign`.
#[derive(Debug, Clone, Serialize)]
pub struct CoSignCertificateRequest {
    #[serde(rename = "TargetUser")]
    pub target_user: String,
    #[serde(rename = "ClientCertificate")]
    pub client_certificate: String,
    #[serde(rename = "ClientPublicKey")]
    pub client_public_key: String,
    #[serde(rename = "KeyShardHash")]
    pub key_shard_hash: String,
}

#[derive(Debug, Deserialize)]
struct CoSignCertificateResponse {
    #[serde(rename = "ClientCertificate")]
    client_certificate: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "Token")]
    token: String,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    #[serde(rename = "Nonce")]
    nonce: String,
}

impl BastionClient {
    /// `base_url` with any trailing slash normalized away.
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST `/api/v2/agent/error`.
    pub async fn report_error(
        &self,
        token: &str,
        reporter: &str,
        message: &str,
        state: &HashMap<String, String>,
    ) -> BastionResult<()> {
        let body = ErrorReport {
            reporter,
            timestamp: Utc::now().to_rfc3339(),
            message,
            state,
        };
        self.post_authed("/api/v2/agent/error", token, &body).await?;
        Ok(())
    }

    /// POST `/api/v2/agent/restart`.
    pub async fn report_restart(
        &self,
        token: &str,
        target_id: &str,
        agent_public_key: &str,
        message: &str,
        state: &HashMap<String, String>,
    ) -> BastionResult<()> {
        let body = RestartReport {
            target_id,
            agent_public_key,
            timestamp: Utc::now().to_rfc3339(),
            message,
            state,
        };
        self.post_authed("/api/v2/agent/restart", token, &body).await?;
        Ok(())
    }

    /// POST `/api/v2/upload-logs/agent` as multipart form data. The archive
    /// always travels under the filename `archive.zip`.
    pub async fn report_logs(
        &self,
        token: &str,
        user_email: &str,
        upload_logs_request_id: &str,
        archive_zip: Vec<u8>,
    ) -> BastionResult<()> {
        let form = reqwest::multipart::Form::new()
            .text("UserEmail", user_email.to_string())
            .text("UploadLogsRequestId", upload_logs_request_id.to_string())
            .part(
                "LogArchiveZip",
                reqwest::multipart::Part::bytes(archive_zip)
                    .file_name("archive.zip")
                    .mime_str("application/zip")
                    .map_err(|e| BastionError::Request(e.to_string()))?,
            );

        let response = self
            .http
            .post(self.url("/api/v2/upload-logs/agent"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// POST `/api/v2/certificate/cosign`; returns the fully signed
    /// certificate PEM.
    pub async fn cosign_certificate(
        &self,
        token: &str,
        request: &CoSignCertificateRequest,
    ) -> BastionResult<String> {
        let response = self
            .post_authed("/api/v2/certificate/cosign", token, request)
            .await?;
        let parsed: CoSignCertificateResponse = response
            .json()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        Ok(parsed.client_certificate)
    }

    /// GET `/api/v2/agent/identity/{targetId}` with the signed message in
    /// the query string; returns the fresh identity token.
    pub async fn get_agent_identity_token(
        &self,
        target_id: &str,
        message_json: &[u8],
        signature_base64: &str,
    ) -> BastionResult<String> {
        let message = base64::engine::general_purpose::STANDARD.encode(message_json);
        let response = self
            .http
            .get(self.url(&format!("/api/v2/agent/identity/{}", target_id)))
            .query(&[("message", message.as_str()), ("signature", signature_base64)])
            .send()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        let response = Self::check_status(response).await?;
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        Ok(parsed.token)
    }

    /// GET the connection nonce the control channel must sign before its
    /// websocket upgrade.
    pub async fn get_challenge_nonce(&self, target_id: &str) -> BastionResult<String> {
        let response = self
            .http
            .get(self.url("/api/v2/agent/challenge"))
            .query(&[("targetId", target_id)])
            .send()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        let response = Self::check_status(response).await?;
        let parsed: NonceResponse = response
            .json()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        Ok(parsed.nonce)
    }

    async fn post_authed<T: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &T,
    ) -> BastionResult<reqwest::Response> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| BastionError::Request(e.to_string()))?;
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> BastionResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BastionError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
