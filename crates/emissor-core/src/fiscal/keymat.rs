//! Key material: PFX decoding and RSA-SHA256 primitives.
//!
//! The decoded bundle lives only for the duration of one signing call. The
//! DER bytes are held in a zeroizing buffer, the password stays behind
//! `SecretString`, and neither appears in errors or logs.

use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use secrecy::ExposeSecret;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::model::CertificateRef;

/// Errors decoding or using key material.
///
/// Variants carry only operation names; never key bytes or passwords.
#[derive(Debug, Error)]
pub enum KeyMaterialError {
    /// The stored bundle is not valid base64.
    #[error("PFX bundle is not valid base64")]
    Base64,

    /// The bundle could not be parsed, usually a wrong password.
    #[error("PFX bundle could not be decoded")]
    Decode,

    /// The bundle carries no private key.
    #[error("PFX bundle contains no private key")]
    MissingKey,

    /// The bundle carries no certificate.
    #[error("PFX bundle contains no certificate")]
    MissingCertificate,

    /// A cryptographic operation failed.
    #[error("crypto operation failed: {operation}")]
    Crypto {
        /// Which operation failed.
        operation: &'static str,
    },
}

/// In-memory signing key and certificate, decoded from a company's PFX.
pub struct KeyMaterial {
    key: PKey<Private>,
    certificate: X509,
}

impl KeyMaterial {
    /// Decodes the company's PFX bundle.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyMaterialError`] describing the decode step that
    /// failed. Wrong passwords surface as [`KeyMaterialError::Decode`].
    pub fn from_certificate(reference: &CertificateRef) -> Result<Self, KeyMaterialError> {
        let compact: String = reference
            .pfx_base64
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let der = Zeroizing::new(
            openssl::base64::decode_block(&compact).map_err(|_| KeyMaterialError::Base64)?,
        );

        let bundle = Pkcs12::from_der(&der).map_err(|_| KeyMaterialError::Decode)?;
        let parsed = bundle
            .parse2(reference.password.expose_secret())
            .map_err(|_| KeyMaterialError::Decode)?;

        let key = parsed.pkey.ok_or(KeyMaterialError::MissingKey)?;
        let certificate = parsed.cert.ok_or(KeyMaterialError::MissingCertificate)?;
        Ok(Self { key, certificate })
    }

    /// Signs `data` with RSA-SHA256 (PKCS#1 v1.5).
    ///
    /// # Errors
    ///
    /// Returns [`KeyMaterialError::Crypto`] when the backend refuses the
    /// operation.
    pub fn sign_sha256(&self, data: &[u8]) -> Result<Vec<u8>, KeyMaterialError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)
            .map_err(|_| KeyMaterialError::Crypto { operation: "sign-init" })?;
        signer
            .update(data)
            .map_err(|_| KeyMaterialError::Crypto { operation: "sign-update" })?;
        signer
            .sign_to_vec()
            .map_err(|_| KeyMaterialError::Crypto { operation: "sign" })
    }

    /// The signing certificate in DER form, for `KeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyMaterialError::Crypto`] when serialization fails.
    pub fn certificate_der(&self) -> Result<Vec<u8>, KeyMaterialError> {
        self.certificate
            .to_der()
            .map_err(|_| KeyMaterialError::Crypto { operation: "cert-der" })
    }
}

/// Verifies an RSA-SHA256 signature against a DER certificate's public key.
///
/// # Errors
///
/// Returns [`KeyMaterialError::Crypto`] when the certificate or key cannot
/// be used; an invalid signature yields `Ok(false)`.
pub fn verify_rsa_sha256(
    certificate_der: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, KeyMaterialError> {
    let certificate = X509::from_der(certificate_der)
        .map_err(|_| KeyMaterialError::Crypto { operation: "cert-parse" })?;
    let public_key = certificate
        .public_key()
        .map_err(|_| KeyMaterialError::Crypto { operation: "pubkey" })?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|_| KeyMaterialError::Crypto { operation: "verify-init" })?;
    verifier
        .update(data)
        .map_err(|_| KeyMaterialError::Crypto { operation: "verify-update" })?;
    verifier
        .verify(signature)
        .map_err(|_| KeyMaterialError::Crypto { operation: "verify" })
}

/// Generates a throwaway self-signed PFX for tests.
#[cfg(test)]
pub(crate) fn test_certificate(password: &str) -> CertificateRef {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;
    use secrecy::SecretString;

    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "EMISSOR TESTE").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(365).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    let bundle = Pkcs12::builder()
        .name("emissor-test")
        .pkey(&pkey)
        .cert(&certificate)
        .build2(password)
        .unwrap();

    CertificateRef {
        pfx_base64: openssl::base64::encode_block(&bundle.to_der().unwrap()),
        password: SecretString::new(password.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_signs() {
        let reference = test_certificate("segredo");
        let material = KeyMaterial::from_certificate(&reference).unwrap();

        let signature = material.sign_sha256(b"payload").unwrap();
        let der = material.certificate_der().unwrap();
        assert!(verify_rsa_sha256(&der, b"payload", &signature).unwrap());
        assert!(!verify_rsa_sha256(&der, b"tampered", &signature).unwrap());
    }

    #[test]
    fn wrong_password_is_a_decode_error() {
        let reference = test_certificate("correta");
        let wrong = CertificateRef {
            pfx_base64: reference.pfx_base64.clone(),
            password: secrecy::SecretString::new("errada".to_string()),
        };
        assert!(matches!(
            KeyMaterial::from_certificate(&wrong),
            Err(KeyMaterialError::Decode)
        ));
    }

    #[test]
    fn garbage_base64_is_rejected() {
        let reference = CertificateRef {
            pfx_base64: "not base64!!".to_string(),
            password: secrecy::SecretString::new(String::new()),
        };
        assert!(matches!(
            KeyMaterial::from_certificate(&reference),
            Err(KeyMaterialError::Base64)
        ));
    }
}
