//! Split-certificate authentication against a self-hosted database.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_config::ShardKeyPair;
use bzero_crypto::{ClientCertificateRequest, EphemeralKey, SplitPrivateKey};
use bzero_types::TunnelError;
use rustls_pki_types::ServerName;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::protocol;
use crate::tls;
use crate::PwdbError;

/// What the agent sends to `/api/v2/certificate/cosign`.
#[derive(Debug, Clone)]
pub struct CoSignRequest {
    pub target_user: String,
    pub client_certificate_pem: String,
    pub client_public_key_pem: String,
    pub key_shard_hash: String,
}

/// The bastion-side co-signing operation, behind a trait so the action does
/// not depend on the HTTP client (and tests can co-sign locally).
#[async_trait]
pub trait CertificateCoSigner: Send + Sync {
    async fn cosign(&self, request: CoSignRequest) -> Result<String, TunnelError>;
}

/// Full split-cert flow: SSL preamble, ephemeral key, partial signature,
/// bastion co-signature, TLS handshake with the result.
pub async fn connect(
    host: &str,
    port: u16,
    target_user: &str,
    shard: &ShardKeyPair,
    cosigner: &dyn CertificateCoSigner,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let mut tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TunnelError::ConnectionRefused,
            _ => TunnelError::ConnectionFailed(e.to_string()),
        })?;

    // 8-byte SSL request; a single 'S' byte means the server will speak TLS.
    protocol::write_ssl_request(&mut tcp)
        .await
        .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer)
        .await
        .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
    if answer[0] != b'S' {
        return Err(TunnelError::TlsDisabled);
    }

    let share = SplitPrivateKey::from_pem(&shard.key_shard_pem)
        .map_err(|e| TunnelError::Internal(format!("unusable key shard: {}", e)))?;

    let client_key = EphemeralKey::generate()
        .map_err(|e| TunnelError::Internal(format!("ephemeral key generation failed: {}", e)))?;

    let request = ClientCertificateRequest::build(
        target_user,
        &client_key
            .public_key_der()
            .map_err(|e| TunnelError::Internal(e.to_string()))?,
        &shard.ca_cert_pem,
    )
    .map_err(|e| TunnelError::Internal(format!("certificate template failed: {}", e)))?;

    let partial = request.partial_sign(&share);

    let cosigned_pem = cosigner
        .cosign(CoSignRequest {
            target_user: target_user.to_string(),
            client_certificate_pem: partial.certificate_pem,
            client_public_key_pem: client_key
                .public_key_pem()
                .map_err(|e| TunnelError::Internal(e.to_string()))?,
            key_shard_hash: share.shard_hash(),
        })
        .await
        .map_err(|e| match e {
            TunnelError::ClientCertCosign(_) => e,
            other => TunnelError::ClientCertCosign(other.to_string()),
        })?;

    let config = tls::split_cert_client_config(
        &shard.ca_cert_pem,
        &cosigned_pem,
        client_key
            .private_key_pkcs8_der()
            .map_err(|e| TunnelError::Internal(e.to_string()))?,
    )
    .map_err(|e| TunnelError::Internal(e.to_string()))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::IncorrectServerName)?;
    let connector = TlsConnector::from(Arc::new(config));

    connector
        .connect(server_name, tcp)
        .await
        .map_err(map_handshake_error)
    // the ephemeral private key dies with this scope; it is never persisted
}

fn map_handshake_error(err: std::io::Error) -> TunnelError {
    use rustls::CertificateError;

    let rustls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match rustls_error {
        Some(rustls::Error::InvalidCertificate(cert_err)) => match cert_err {
            CertificateError::UnknownIssuer => TunnelError::PwdbUnknownAuthority,
            CertificateError::Expired => TunnelError::ServerCertificateExpired,
            CertificateError::NotValidForName => TunnelError::IncorrectServerName,
            other => TunnelError::ConnectionFailed(format!("invalid certificate: {:?}", other)),
        },
        _ => TunnelError::ConnectionFailed(err.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rustls::server::WebPkiClientVerifier;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn pem_certs(pem: &str) -> Vec<CertificateDer<'static>> {
        let mut reader = std::io::BufReader::new(pem.as_bytes());
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn pem_key(pem: &str) -> PrivateKeyDer<'static> {
        let mut reader = std::io::BufReader::new(pem.as_bytes());
        rustls_pemfile::private_key(&mut reader).unwrap().unwrap()
    }

    /// In-process PostgreSQL-ish server: answers 'S' to the SSL request,
    /// then runs a TLS server handshake demanding a client certificate
    /// chained to the test CA, reads one byte, echoes it.
    async fn spawn_tls_server(pki: &TestPki) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut roots = rustls::RootCertStore::empty();
        for cert in pem_certs(&pki.ca_cert_pem) {
            roots.add(cert).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder(roots.into()).build().unwrap();

        let server_certs = pem_certs(&pki.server_cert_pem);
        let server_key = pem_key(&pki.server_key_pem);

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(server_certs, server_key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            // SSLRequest preamble
            let mut preamble = [0u8; 8];
            tcp.read_exact(&mut preamble).await.unwrap();
            tcp.write_all(b"S").await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut byte = [0u8; 1];
            tls.read_exact(&mut byte).await.unwrap();
            tls.write_all(&byte).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_split_cert_handshake_end_to_end() {
        let pki = TestPki::generate();
        let addr = spawn_tls_server(&pki).await;

        let shard = pki.shard();
        let agent_share = SplitPrivateKey::from_pem(&pki.agent_share_pem).unwrap();
        let cosigner = LocalCoSigner {
            share: pki.bastion_share.clone(),
            expected_hash: agent_share.shard_hash(),
        };

        let mut tls = connect("localhost", addr.port(), "alice", &shard, &cosigner)
            .await
            .expect("split-cert handshake should succeed");

        tls.write_all(&[0x00]).await.unwrap();
        let mut echo = [0u8; 1];
        tls.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo[0], 0x00);
    }

    #[tokio::test]
    async fn test_server_without_ssl_yields_tls_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut preamble = [0u8; 8];
            tcp.read_exact(&mut preamble).await.unwrap();
            tcp.write_all(b"N").await.unwrap();
        });

        let pki = TestPki::generate();
        let agent_share = SplitPrivateKey::from_pem(&pki.agent_share_pem).unwrap();
        let cosigner = LocalCoSigner {
            share: pki.bastion_share.clone(),
            expected_hash: agent_share.shard_hash(),
        };
        let err = connect("127.0.0.1", addr.port(), "alice", &pki.shard(), &cosigner)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::TlsDisabled));
    }

    #[tokio::test]
    async fn test_unknown_ca_maps_to_unknown_authority() {
        // server chained to a different CA than the shard's
        let server_pki = TestPki::generate();
        let addr = spawn_tls_server(&server_pki).await;

        let client_pki = TestPki::generate();
        let agent_share = SplitPrivateKey::from_pem(&client_pki.agent_share_pem).unwrap();
        let cosigner = LocalCoSigner {
            share: client_pki.bastion_share.clone(),
            expected_hash: agent_share.shard_hash(),
        };

        let err = connect(
            "localhost",
            addr.port(),
            "alice",
            &client_pki.shard(),
            &cosigner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::PwdbUnknownAuthority));
    }
}
