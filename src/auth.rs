//! Device authenticator (C2): nonce issuance and RSA-SHA256 signature
//! verification against a certificate fetched from the registry.

use crate::registry::DeviceRegistry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::sync::Arc;

const NONCE_LEN: usize = 24;

/// Verifies device signatures against certificates fetched through a
/// [`DeviceRegistry`]. Never throws: any fetch failure, malformed input, or
/// verification failure collapses to `false`.
pub struct DeviceAuthenticator {
    registry: Arc<dyn DeviceRegistry>,
}

impl DeviceAuthenticator {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// 24 cryptographically random bytes, base64 encoded.
    pub fn new_nonce(&self) -> String {
        let mut bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }

    /// Verify `sig_b64` is a valid RSA-PKCS1v15/SHA-256 signature over
    /// `"{device_id}.{nonce}"`, using the certificate the registry returns
    /// for `device_id`. Returns `false` on any failure rather than
    /// propagating an error, per the authenticator's never-throws contract.
    pub async fn verify(&self, device_id: &str, nonce: &str, sig_b64: &str) -> bool {
        let cert_pem = match self.registry.lookup_certificate(device_id).await {
            Ok(Some(pem)) => pem,
            Ok(None) => {
                tracing::warn!(device_id, "no certificate on file, auth fails");
                return false;
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "certificate lookup failed, auth fails");
                return false;
            }
        };

        verify_signature(&cert_pem, device_id, nonce, sig_b64)
    }
}

/// Pure signature check, split out from the registry lookup so it can be
/// unit tested without a [`DeviceRegistry`].
fn verify_signature(cert_pem: &str, device_id: &str, nonce: &str, sig_b64: &str) -> bool {
    let public_key = match RsaPublicKey::from_public_key_pem(cert_pem) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(error = %e, "malformed certificate PEM");
            return false;
        }
    };

    let sig_bytes = match BASE64.decode(sig_b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "malformed base64 signature");
            return false;
        }
    };

    let signature = match Signature::try_from(sig_bytes.as_slice()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::debug!(error = %e, "malformed signature encoding");
            return false;
        }
    };

    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let message = format!("{device_id}.{nonce}");

    verifying_key.verify(message.as_bytes(), &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    fn generate_keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (private_key, pem)
    }

    fn sign(private_key: &RsaPrivateKey, device_id: &str, nonce: &str) -> String {
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        let message = format!("{device_id}.{nonce}");
        let signature = signing_key.sign(message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    #[test]
    fn valid_signature_verifies() {
        let (private_key, cert_pem) = generate_keypair();
        let sig_b64 = sign(&private_key, "devA", "noncevalue");
        assert!(verify_signature(&cert_pem, "devA", "noncevalue", &sig_b64));
    }

    #[test]
    fn signature_over_wrong_device_id_fails() {
        let (private_key, cert_pem) = generate_keypair();
        let sig_b64 = sign(&private_key, "devA", "noncevalue");
        assert!(!verify_signature(&cert_pem, "devB", "noncevalue", &sig_b64));
    }

    #[test]
    fn truncated_base64_returns_false_without_panicking() {
        let (_private_key, cert_pem) = generate_keypair();
        assert!(!verify_signature(&cert_pem, "devA", "nonce", "AAAA"));
    }

    #[test]
    fn malformed_certificate_returns_false() {
        assert!(!verify_signature("not a pem", "devA", "nonce", "AAAA=="));
    }

    #[tokio::test]
    async fn missing_certificate_fails_closed() {
        let registry = Arc::new(StaticRegistry::new());
        let authenticator = DeviceAuthenticator::new(registry);
        assert!(!authenticator.verify("devA", "nonce", "AAAA==").await);
    }

    #[tokio::test]
    async fn end_to_end_through_registry() {
        let (private_key, cert_pem) = generate_keypair();
        let registry = Arc::new(StaticRegistry::new().with_certificate("devA", cert_pem));
        let authenticator = DeviceAuthenticator::new(registry);

        let nonce = authenticator.new_nonce();
        assert_eq!(BASE64.decode(&nonce).unwrap().len(), NONCE_LEN);

        let sig_b64 = sign(&private_key, "devA", &nonce);
        assert!(authenticator.verify("devA", &nonce, &sig_b64).await);
    }
}
