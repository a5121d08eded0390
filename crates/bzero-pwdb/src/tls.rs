//! TLS client configurations for the two pwdb hops.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::{PwdbError, PwdbResult};

/// Client config authenticating with the co-signed client certificate and
/// trusting only the shard's CA.
pub fn split_cert_client_config(
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pkcs8_der: Vec<u8>,
) -> PwdbResult<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in pem_certs(ca_cert_pem)? {
        roots
            .add(cert)
            .map_err(|e| PwdbError::Tls(format!("bad CA certificate: {}", e)))?;
    }

    let client_chain = pem_certs(client_cert_pem)?;
    let key = PrivateKeyDer::Pkcs8(client_key_pkcs8_der.into());

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(client_chain, key)
        .map_err(|e| PwdbError::Tls(e.to_string()))
}

/// Client config for the onward RDS hop. The IAM token is the credential;
/// the server certificate is deliberately not verified, mirroring
/// `InsecureSkipVerify` on the original hop.
pub fn insecure_upstream_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth()
}

fn pem_certs(pem: &str) -> PwdbResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PwdbError::Tls(format!("bad PEM: {}", e)))
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
