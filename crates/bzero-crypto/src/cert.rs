//! X.509 client-certificate templates for split-key co-signing.
//!
//! The agent builds a one-hour client certificate for the database role
//! name, signs it partially with its key share, and ships the result to the
//! bastion's cosign endpoint. The co-signed certificate verifies under the
//! CA public key embedded in the key-shard entry.

use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::der;
use crate::split::{pem_decode, pem_encode, SplitPrivateKey};
use crate::{CryptoError, CryptoResult};

const CERT_PEM_LABEL: &str = "CERTIFICATE";

/// Client-certificate validity window.
pub const CLIENT_CERT_LIFETIME_HOURS: i64 = 1;

/// An unsigned client-certificate template.
pub struct ClientCertificateRequest {
    target_user: String,
    tbs_der: Vec<u8>,
}

impl ClientCertificateRequest {
    /// Build the template: `CN = target_user`, validity now..now+1h,
    /// `ExtKeyUsage = ClientAuth`, `KeyUsage = DigitalSignature`, random
    /// serial, issuer copied from the CA certificate.
    pub fn build(
        target_user: &str,
        subject_public_key_der: &[u8],
        ca_cert_pem: &str,
    ) -> CryptoResult<Self> {
        let ca_der = pem_decode(CERT_PEM_LABEL, ca_cert_pem)?;
        let (_, ca) = X509Certificate::from_der(&ca_der)
            .map_err(|e| CryptoError::CertificateParse(e.to_string()))?;
        let issuer = ca.subject().as_raw().to_vec();

        let not_before = Utc::now();
        let not_after = not_before + Duration::hours(CLIENT_CERT_LIFETIME_HOURS);

        let mut serial = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7f; // keep the INTEGER positive

        let signature_algorithm = der::sequence(&[&der::oid(der::OID_SHA256_WITH_RSA), &der::null()]);

        let subject = der::sequence(&[&der::set(&[&der::sequence(&[
            &der::oid(der::OID_COMMON_NAME),
            &der::utf8_string(target_user),
        ])])]);

        // KeyUsage digitalSignature only: first bit set, seven unused.
        let key_usage = der::sequence(&[
            &der::oid(der::OID_KEY_USAGE),
            &der::boolean(true),
            &der::octet_string(&der::bit_string(7, &[0x80])),
        ]);
        let ext_key_usage = der::sequence(&[
            &der::oid(der::OID_EXT_KEY_USAGE),
            &der::octet_string(&der::sequence(&[&der::oid(der::OID_CLIENT_AUTH)])),
        ]);
        let extensions = der::explicit(3, &der::sequence(&[&key_usage, &ext_key_usage]));

        let tbs_der = der::sequence(&[
            &der::explicit(0, &der::integer(&[2])), // v3
            &der::integer(&serial),
            &signature_algorithm,
            &issuer,
            &der::sequence(&[&der::utc_time(&not_before), &der::utc_time(&not_after)]),
            &subject,
            subject_public_key_der,
            &extensions,
        ]);

        Ok(Self {
            target_user: target_user.to_string(),
            tbs_der,
        })
    }

    pub fn target_user(&self) -> &str {
        &self.target_user
    }

    /// Partially sign the template with the agent's key share.
    pub fn partial_sign(&self, share: &SplitPrivateKey) -> SplitClientCertificate {
        let digest: [u8; 32] = Sha256::digest(&self.tbs_der).into();
        let partial = share.partial_sign_digest(&digest);
        SplitClientCertificate {
            certificate_pem: pem_encode(CERT_PEM_LABEL, &assemble_der(&self.tbs_der, &partial)),
        }
    }
}

/// A client certificate carrying a partial signature; invalid until
/// co-signed by the holder of the complementary share.
#[derive(Debug, Clone)]
pub struct SplitClientCertificate {
    pub certificate_pem: String,
}

/// Apply the complementary share to a partially signed certificate,
/// producing the fully signed PEM. This is the co-signer-side operation.
pub fn co_sign_certificate(partial_cert_pem: &str, share: &SplitPrivateKey) -> CryptoResult<String> {
    let der_bytes = pem_decode(CERT_PEM_LABEL, partial_cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der_bytes)
        .map_err(|e| CryptoError::CertificateParse(e.to_string()))?;

    let tbs_raw: &[u8] = cert.tbs_certificate.as_ref();
    let digest: [u8; 32] = Sha256::digest(tbs_raw).into();
    let full = share.co_sign(&cert.signature_value.data, &digest);

    Ok(pem_encode(CERT_PEM_LABEL, &assemble_der(tbs_raw, &full)))
}

fn assemble_der(tbs_der: &[u8], signature: &[u8]) -> Vec<u8> {
    let signature_algorithm = der::sequence(&[&der::oid(der::OID_SHA256_WITH_RSA), &der::null()]);
    der::sequence(&[tbs_der, &signature_algorithm, &der::bit_string(0, signature)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::EphemeralKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    /// Self-signed CA built with the same DER writer, fully signed.
    fn self_signed_ca(key: &RsaPrivateKey) -> String {
        let spki = key.to_public_key().to_public_key_der().unwrap();
        let name = der::sequence(&[&der::set(&[&der::sequence(&[
            &der::oid(der::OID_COMMON_NAME),
            &der::utf8_string("bzero test ca"),
        ])])]);
        let not_before = Utc::now() - Duration::hours(1);
        let not_after = not_before + Duration::days(365);
        let signature_algorithm = der::sequence(&[&der::oid(der::OID_SHA256_WITH_RSA), &der::null()]);
        let basic_constraints = der::sequence(&[
            &der::oid(der::OID_BASIC_CONSTRAINTS),
            &der::boolean(true),
            &der::octet_string(&der::sequence(&[&der::boolean(true)])),
        ]);
        let tbs = der::sequence(&[
            &der::explicit(0, &der::integer(&[2])),
            &der::integer(&[0x01]),
            &signature_algorithm,
            &name,
            &der::sequence(&[&der::utc_time(&not_before), &der::utc_time(&not_after)]),
            &name,
            spki.as_bytes(),
            &der::explicit(3, &der::sequence(&[&basic_constraints])),
        ]);
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key.sign(&tbs).to_vec();
        pem_encode(CERT_PEM_LABEL, &assemble_der(&tbs, &signature))
    }

    #[test]
    fn test_cosigned_certificate_verifies_under_ca() {
        let ca_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let ca_pem = self_signed_ca(&ca_key);
        let (agent_share, bastion_share) = SplitPrivateKey::split_from(&ca_key);

        let client_key = EphemeralKey::generate().unwrap();
        let request = ClientCertificateRequest::build(
            "alice",
            &client_key.public_key_der().unwrap(),
            &ca_pem,
        )
        .unwrap();

        let partial = request.partial_sign(&agent_share);
        let full_pem = co_sign_certificate(&partial.certificate_pem, &bastion_share).unwrap();

        let ca_der = pem_decode(CERT_PEM_LABEL, &ca_pem).unwrap();
        let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
        let full_der = pem_decode(CERT_PEM_LABEL, &full_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&full_der).unwrap();

        assert_eq!(cert.subject().to_string(), "CN=alice");
        cert.verify_signature(Some(ca.public_key())).unwrap();
    }

    #[test]
    fn test_partial_certificate_does_not_verify() {
        let ca_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let ca_pem = self_signed_ca(&ca_key);
        let (agent_share, _) = SplitPrivateKey::split_from(&ca_key);

        let client_key = EphemeralKey::generate().unwrap();
        let request = ClientCertificateRequest::build(
            "alice",
            &client_key.public_key_der().unwrap(),
            &ca_pem,
        )
        .unwrap();
        let partial = request.partial_sign(&agent_share);

        let ca_der = pem_decode(CERT_PEM_LABEL, &ca_pem).unwrap();
        let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
        let partial_der = pem_decode(CERT_PEM_LABEL, &partial.certificate_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&partial_der).unwrap();

        assert!(cert.verify_signature(Some(ca.public_key())).is_err());
    }

    #[test]
    fn test_template_validity_window() {
        let ca_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let ca_pem = self_signed_ca(&ca_key);
        let (agent_share, bastion_share) = SplitPrivateKey::split_from(&ca_key);

        let client_key = EphemeralKey::generate().unwrap();
        let request = ClientCertificateRequest::build(
            "dbadmin",
            &client_key.public_key_der().unwrap(),
            &ca_pem,
        )
        .unwrap();
        let partial = request.partial_sign(&agent_share);
        let full_pem = co_sign_certificate(&partial.certificate_pem, &bastion_share).unwrap();

        let full_der = pem_decode(CERT_PEM_LABEL, &full_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&full_der).unwrap();
        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, CLIENT_CERT_LIFETIME_HOURS * 3600);
        assert!(cert.validity().is_valid());
    }
}
