//! Enveloped XMLDSig over the `infNFe` subtree.
//!
//! The signed reference is `#<Id>`, transforms are enveloped-signature plus
//! C14N, the digest is SHA-256 over the canonicalized subtree, and the
//! signature is RSA-SHA256. `KeyInfo` carries a single base64 DER
//! certificate. None of the failures here are retryable on the same inputs.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::c14n::{self, C14nError};
use super::keymat::{self, KeyMaterial, KeyMaterialError};
use super::DSIG_NAMESPACE;

/// Canonicalization algorithm identifier required by the authority.
const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
/// Enveloped-signature transform identifier.
const ENVELOPED_ALGORITHM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// RSA-SHA256 signature algorithm identifier.
const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha256";
/// SHA-256 digest algorithm identifier.
const SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// Errors producing or checking an enveloped signature.
#[derive(Debug, Error)]
pub enum SignError {
    /// Key material could not be decoded or used.
    #[error("key unavailable: {0}")]
    KeyUnavailable(#[from] KeyMaterialError),

    /// The subtree could not be canonicalized.
    #[error("canonicalization failed: {0}")]
    CanonicalizationFailed(#[from] C14nError),

    /// The document does not end in the expected root element.
    #[error("sign failed: document root close tag not found")]
    SignFailed,

    /// A signature component is missing or does not verify.
    #[error("signature invalid: {0}")]
    Invalid(&'static str),
}

/// Signs the document in place, appending `Signature` under the root.
///
/// `reference_id` is the value of the `Id` attribute of the subtree to sign
/// (`NFe` + access key).
///
/// # Errors
///
/// [`SignError::CanonicalizationFailed`] when the reference subtree is
/// absent or malformed, [`SignError::KeyUnavailable`] when the key refuses
/// the operation, [`SignError::SignFailed`] when the signature cannot be
/// spliced into the document.
pub fn sign_enveloped(
    doc: &[u8],
    reference_id: &str,
    material: &KeyMaterial,
) -> Result<Vec<u8>, SignError> {
    let canonical = c14n::canonicalize_by_id(doc, reference_id)?;
    let digest = openssl::base64::encode_block(&Sha256::digest(&canonical));

    let signed_info_canonical = signed_info(reference_id, &digest, true);
    let signature_value =
        openssl::base64::encode_block(&material.sign_sha256(signed_info_canonical.as_bytes())?);
    let certificate = openssl::base64::encode_block(&material.certificate_der()?);

    let signature_element = format!(
        concat!(
            "<Signature xmlns=\"{ns}\">",
            "{signed_info}",
            "<SignatureValue>{value}</SignatureValue>",
            "<KeyInfo><X509Data><X509Certificate>{cert}</X509Certificate></X509Data></KeyInfo>",
            "</Signature>"
        ),
        ns = DSIG_NAMESPACE,
        signed_info = signed_info(reference_id, &digest, false),
        value = signature_value,
        cert = certificate,
    );

    // The assembler closes the document with the root tag; the signature is
    // appended as the last child of the root.
    let close_tag = b"</NFe>";
    let position = doc
        .windows(close_tag.len())
        .rposition(|window| window == close_tag)
        .ok_or(SignError::SignFailed)?;

    let mut signed = Vec::with_capacity(doc.len() + signature_element.len());
    signed.extend_from_slice(&doc[..position]);
    signed.extend_from_slice(signature_element.as_bytes());
    signed.extend_from_slice(&doc[position..]);
    Ok(signed)
}

/// Renders `SignedInfo`, either in canonical form (explicit namespace, used
/// as the signing input) or in embedded form (namespace inherited from the
/// enclosing `Signature`).
fn signed_info(reference_id: &str, digest: &str, canonical: bool) -> String {
    let ns_decl = if canonical {
        format!(" xmlns=\"{DSIG_NAMESPACE}\"")
    } else {
        String::new()
    };
    format!(
        concat!(
            "<SignedInfo{ns}>",
            "<CanonicalizationMethod Algorithm=\"{c14n}\"></CanonicalizationMethod>",
            "<SignatureMethod Algorithm=\"{rsa}\"></SignatureMethod>",
            "<Reference URI=\"#{id}\">",
            "<Transforms>",
            "<Transform Algorithm=\"{enveloped}\"></Transform>",
            "<Transform Algorithm=\"{c14n}\"></Transform>",
            "</Transforms>",
            "<DigestMethod Algorithm=\"{sha}\"></DigestMethod>",
            "<DigestValue>{digest}</DigestValue>",
            "</Reference>",
            "</SignedInfo>"
        ),
        ns = ns_decl,
        c14n = C14N_ALGORITHM,
        rsa = RSA_SHA256_ALGORITHM,
        enveloped = ENVELOPED_ALGORITHM,
        sha = SHA256_ALGORITHM,
        id = reference_id,
        digest = digest,
    )
}

/// Verifies the enveloped signature of a signed document.
///
/// Recomputes the digest over the canonicalized reference subtree and
/// checks the RSA signature over the canonicalized `SignedInfo` against the
/// embedded certificate.
///
/// # Errors
///
/// [`SignError::Invalid`] naming the first check that failed.
pub fn verify_enveloped(doc: &[u8]) -> Result<(), SignError> {
    let id = c14n::element_attr(doc, "infNFe", "Id")?
        .ok_or(SignError::Invalid("reference subtree missing"))?;

    let digest_value =
        c14n::element_text(doc, "DigestValue")?.ok_or(SignError::Invalid("DigestValue missing"))?;
    let signature_value = c14n::element_text(doc, "SignatureValue")?
        .ok_or(SignError::Invalid("SignatureValue missing"))?;
    let certificate_b64 = c14n::element_text(doc, "X509Certificate")?
        .ok_or(SignError::Invalid("X509Certificate missing"))?;

    let canonical = c14n::canonicalize_by_id(doc, &id)?;
    let digest = openssl::base64::encode_block(&Sha256::digest(&canonical));
    if digest != digest_value.trim() {
        return Err(SignError::Invalid("digest mismatch"));
    }

    let signed_info_canonical = c14n::canonicalize_by_name(doc, "SignedInfo")?;
    let signature = openssl::base64::decode_block(signature_value.trim())
        .map_err(|_| SignError::Invalid("SignatureValue is not base64"))?;
    let certificate = openssl::base64::decode_block(certificate_b64.trim())
        .map_err(|_| SignError::Invalid("X509Certificate is not base64"))?;

    let valid = keymat::verify_rsa_sha256(&certificate, &signed_info_canonical, &signature)?;
    if valid {
        Ok(())
    } else {
        Err(SignError::Invalid("signature mismatch"))
    }
}

/// Lifts the `DigestValue` out of a signed document for the QR payload.
///
/// # Errors
///
/// [`SignError::Invalid`] when the document carries no digest.
pub fn digest_value(doc: &[u8]) -> Result<String, SignError> {
    c14n::element_text(doc, "DigestValue")?
        .map(|value| value.trim().to_string())
        .ok_or(SignError::Invalid("DigestValue missing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::assembler::{build_document, sample_access_key, sample_input};
    use crate::fiscal::keymat::test_certificate;
    use crate::model::{sample_company, sample_payload};

    fn signed_document() -> (Vec<u8>, String) {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let doc = build_document(&sample_input(&payload, &company, &key)).unwrap();

        let reference = test_certificate("segredo");
        let material = KeyMaterial::from_certificate(&reference).unwrap();
        let signed = sign_enveloped(&doc, &format!("NFe{key}"), &material).unwrap();
        (signed, key)
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let (signed, _) = signed_document();
        verify_enveloped(&signed).unwrap();

        let text = String::from_utf8(signed).unwrap();
        assert!(text.contains("<Signature xmlns=\"http://www.w3.org/2000/09/xmldsig#\">"));
        assert!(text.ends_with("</Signature></NFe>"));
        // Exactly one X509Certificate entry.
        assert_eq!(text.matches("<X509Certificate>").count(), 1);
    }

    #[test]
    fn tampering_with_the_subtree_invalidates() {
        let (signed, _) = signed_document();
        let tampered = String::from_utf8(signed)
            .unwrap()
            .replace("<vNF>29.90</vNF>", "<vNF>29.91</vNF>");
        assert!(matches!(
            verify_enveloped(tampered.as_bytes()),
            Err(SignError::Invalid("digest mismatch"))
        ));
    }

    #[test]
    fn tampering_with_signed_info_invalidates() {
        let (signed, key) = signed_document();
        // Re-point the reference at a different id: digest input changes.
        let tampered = String::from_utf8(signed)
            .unwrap()
            .replace(&format!("URI=\"#NFe{key}\""), "URI=\"#NFeother\"");
        assert!(verify_enveloped(tampered.as_bytes()).is_err());
    }

    #[test]
    fn digest_value_is_extracted() {
        let (signed, _) = signed_document();
        let digest = digest_value(&signed).unwrap();
        assert!(!digest.is_empty());
        assert!(openssl::base64::decode_block(&digest).is_ok());
    }

    #[test]
    fn signing_unknown_reference_fails() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let doc = build_document(&sample_input(&payload, &company, &key)).unwrap();

        let reference = test_certificate("segredo");
        let material = KeyMaterial::from_certificate(&reference).unwrap();
        assert!(matches!(
            sign_enveloped(&doc, "NFe000", &material),
            Err(SignError::CanonicalizationFailed(C14nError::NotFound(_)))
        ));
    }
}
