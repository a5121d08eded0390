//! IAM auth-token providers for the brokered connection modes.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bzero_types::TunnelError;

/// Produces a short-lived credential for `db_user` at `host:port`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, host: &str, port: u16, db_user: &str)
        -> Result<String, TunnelError>;
}

/// Fixed token, for tests and pre-brokered deployments.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(
        &self,
        _host: &str,
        _port: u16,
        _db_user: &str,
    ) -> Result<String, TunnelError> {
        Ok(self.token.clone())
    }
}

/// RDS IAM auth tokens: a SigV4-presigned `connect` request, valid 15
/// minutes, sent to the server as the password.
pub struct RdsIamTokenProvider {
    region: String,
}

const RDS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

impl RdsIamTokenProvider {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    /// AWS region inferred from the RDS endpoint
    /// (`<db>.<id>.<region>.rds.amazonaws.com`).
    pub fn from_endpoint(host: &str) -> Result<Self, TunnelError> {
        let region = host
            .strip_suffix(".rds.amazonaws.com")
            .and_then(|prefix| prefix.rsplit('.').next())
            .ok_or_else(|| {
                TunnelError::ConnectionFailed(format!("cannot infer region from host {}", host))
            })?;
        Ok(Self::new(region))
    }
}

#[async_trait]
impl TokenProvider for RdsIamTokenProvider {
    async fn fetch_token(
        &self,
        host: &str,
        port: u16,
        db_user: &str,
    ) -> Result<String, TunnelError> {
        use aws_config::BehaviorVersion;
        use aws_credential_types::provider::ProvideCredentials;
        use aws_sigv4::http_request::{
            sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
        };
        use aws_sigv4::sign::v4;

        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let credentials = config
            .credentials_provider()
            .ok_or_else(|| TunnelError::ConnectionFailed("no AWS credentials configured".into()))?
            .provide_credentials()
            .await
            .map_err(|e| TunnelError::ConnectionFailed(format!("AWS credentials: {}", e)))?;
        let identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(RDS_TOKEN_TTL);

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("rds-db")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| TunnelError::ConnectionFailed(format!("signing params: {}", e)))?;

        let url = format!("https://{}:{}/?Action=connect&DBUser={}", host, port, db_user);
        let signable = SignableRequest::new(
            "GET",
            &url,
            std::iter::empty(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| TunnelError::ConnectionFailed(format!("signable request: {}", e)))?;

        let (instructions, _signature) = sign(signable, &params.into())
            .map_err(|e| TunnelError::ConnectionFailed(format!("sigv4 signing: {}", e)))?
            .into_parts();

        let mut request = http::Request::builder()
            .method("GET")
            .uri(&url)
            .body(())
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
        instructions.apply_to_request_http1x(&mut request);

        // the token is the signed URL minus the scheme
        let signed = request.uri().to_string();
        Ok(signed
            .strip_prefix("https://")
            .unwrap_or(signed.as_str())
            .to_string())
    }
}

/// Cloud SQL IAM tokens: an OAuth access token for the `sqlservice` scope,
/// delegated as a cleartext password inside the TLS hop.
pub struct GcpIamTokenProvider;

const GCP_SQL_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.admin";

#[async_trait]
impl TokenProvider for GcpIamTokenProvider {
    async fn fetch_token(
        &self,
        _host: &str,
        _port: u16,
        _db_user: &str,
    ) -> Result<String, TunnelError> {
        use google_cloud_auth::project::Config;
        use google_cloud_auth::token::DefaultTokenSourceProvider;
        use google_cloud_token::TokenSourceProvider;

        let provider = DefaultTokenSourceProvider::new(Config {
            audience: None,
            scopes: Some(&[GCP_SQL_SCOPE]),
            sub: None,
        })
        .await
        .map_err(|e| TunnelError::ConnectionFailed(format!("GCP credentials: {}", e)))?;

        let token = provider
            .token_source()
            .token()
            .await
            .map_err(|e| TunnelError::ConnectionFailed(format!("GCP token: {}", e)))?;
        Ok(token.trim_start_matches("Bearer ").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("tok");
        assert_eq!(
            provider.fetch_token("h", 5432, "u").await.unwrap(),
            "tok"
        );
    }

    #[test]
    fn test_region_inference() {
        let provider =
            RdsIamTokenProvider::from_endpoint("mydb.abc123.us-east-1.rds.amazonaws.com").unwrap();
        assert_eq!(provider.region, "us-east-1");
        assert!(RdsIamTokenProvider::from_endpoint("db.example.com").is_err());
    }
}
