//! Company record: the narrow configuration surface the pipeline reads.
//!
//! The admin surface that maintains companies is external; the worker only
//! ever loads the certificate, the contributor secret, and the address block
//! through [`crate::store::CompanyStore`].

use secrecy::SecretString;
use uuid::Uuid;

use super::payload::Uf;

/// Issuer address emitted in the XML `enderEmit` block.
#[derive(Debug, Clone)]
pub struct Address {
    /// Street name.
    pub street: String,
    /// Street number.
    pub number: String,
    /// District.
    pub district: String,
    /// IBGE municipality code.
    pub municipality_code: String,
    /// Municipality name.
    pub municipality: String,
    /// State.
    pub uf: Uf,
    /// Postal code, 8 digits.
    pub postal_code: String,
    /// Phone, digits only.
    pub phone: Option<String>,
}

/// Encrypted signing certificate reference.
///
/// The PFX bytes live encrypted in the store and are decoded into in-memory
/// key material only for the duration of a signing call.
#[derive(Clone)]
pub struct CertificateRef {
    /// Base64-encoded PKCS#12 bundle.
    pub pfx_base64: String,
    /// Bundle password.
    pub password: SecretString,
}

impl std::fmt::Debug for CertificateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Neither the bundle nor the password belongs in logs.
        f.debug_struct("CertificateRef").finish_non_exhaustive()
    }
}

/// Contributor secret (CSC) used to hash the QR payload.
#[derive(Clone)]
pub struct ContributorSecret {
    /// Public identifier (`cIdToken`).
    pub id: String,
    /// Secret token.
    pub token: SecretString,
}

impl std::fmt::Debug for ContributorSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContributorSecret")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// The company aggregate as the pipeline sees it.
#[derive(Debug, Clone)]
pub struct Company {
    /// Company id.
    pub id: Uuid,
    /// Tax id (CNPJ), 14 digits.
    pub cnpj: String,
    /// Registered corporate name (`xNome`).
    pub legal_name: String,
    /// Trade name (`xFant`).
    pub trade_name: Option<String>,
    /// State registration (`IE`).
    pub ie: String,
    /// Tax regime code (`CRT`).
    pub crt: String,
    /// Registered address.
    pub address: Address,
    /// Signing certificate.
    pub certificate: CertificateRef,
    /// Contributor secret.
    pub csc: ContributorSecret,
}

/// A company record for tests across the crate. The certificate is empty;
/// tests that need signing generate their own PFX.
#[cfg(test)]
pub(crate) fn sample_company() -> Company {
    Company {
        id: Uuid::new_v4(),
        cnpj: "12345678000195".to_string(),
        legal_name: "PAPELARIA MODELO LTDA".to_string(),
        trade_name: Some("PAPELARIA MODELO".to_string()),
        ie: "1234567890".to_string(),
        crt: "1".to_string(),
        address: Address {
            street: "RUA AUGUSTA".to_string(),
            number: "1200".to_string(),
            district: "CONSOLACAO".to_string(),
            municipality_code: "3550308".to_string(),
            municipality: "SAO PAULO".to_string(),
            uf: Uf::SP,
            postal_code: "01304001".to_string(),
            phone: Some("1133334444".to_string()),
        },
        certificate: CertificateRef {
            pfx_base64: String::new(),
            password: SecretString::new(String::new()),
        },
        csc: ContributorSecret {
            id: "000001".to_string(),
            token: SecretString::new("CSC-TOKEN".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secrets() {
        let cert = CertificateRef {
            pfx_base64: "AAAA".to_string(),
            password: SecretString::new("hunter2".to_string()),
        };
        let printed = format!("{cert:?}");
        assert!(!printed.contains("AAAA"));
        assert!(!printed.contains("hunter2"));

        let csc = ContributorSecret {
            id: "000001".to_string(),
            token: SecretString::new("super-secret".to_string()),
        };
        let printed = format!("{csc:?}");
        assert!(printed.contains("000001"));
        assert!(!printed.contains("super-secret"));
    }
}
