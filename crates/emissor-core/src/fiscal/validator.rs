//! XSD validation of assembled and signed documents.
//!
//! Validation runs twice per emission: before signing (malformed structure
//! is caught early) and after signing (structural damage introduced by
//! signing is caught before submission). Failures are fatal and never
//! retried; they indicate an assembler or signer bug.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::c14n;

/// Official distribution endpoint for the v4.00 schema set.
const SCHEMA_BASE_URL: &str = "http://www.portalfiscal.inf.br/nfe/xsd";

/// File names of the schema set kept on local disk.
const SCHEMA_FILES: &[&str] = &[
    "nfe_v4.00.xsd",
    "leiauteNFe_v4.00.xsd",
    "tiposBasico_v4.00.xsd",
    "xmldsig-core-schema_v1.01.xsd",
    "procNFe_v4.00.xsd",
    "retEnviNFe_v4.00.xsd",
    "consStatServ_v4.00.xsd",
    "retConsStatServ_v4.00.xsd",
];

/// Schema-validation failures.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// The configured schema directory does not exist.
    #[error("schema directory missing: {0}")]
    SchemaDirMissing(PathBuf),

    /// The XSD set could not be parsed.
    #[error("schema load failed: {0}")]
    SchemaLoad(String),

    /// The document is not well-formed XML.
    #[error("document malformed: {0}")]
    Malformed(String),

    /// The document violates the schema.
    #[error("schema violations: {0}")]
    Violations(String),

    /// Refreshing the schema set from the authority failed.
    #[error("schema download failed: {0}")]
    Download(String),
}

/// A document validator the pipeline can run before and after signing.
pub trait DocumentValidator: Send + Sync {
    /// Validates the document bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidatorError`] describing the first problem found.
    fn validate(&self, doc: &[u8]) -> Result<(), ValidatorError>;
}

/// Production validator backed by the official XSD set via libxml2.
///
/// Contexts are built per call: libxml handles are not `Send`, and keeping
/// them out of the struct keeps the validator usable across worker tasks.
pub struct XsdValidator {
    entry_schema: PathBuf,
}

impl XsdValidator {
    /// Opens a validator over the schema directory.
    ///
    /// # Errors
    ///
    /// [`ValidatorError::SchemaDirMissing`] when the directory or the entry
    /// schema is absent.
    pub fn new(schema_dir: impl AsRef<Path>) -> Result<Self, ValidatorError> {
        let dir = schema_dir.as_ref();
        if !dir.is_dir() {
            return Err(ValidatorError::SchemaDirMissing(dir.to_path_buf()));
        }
        let entry_schema = dir.join("nfe_v4.00.xsd");
        if !entry_schema.is_file() {
            return Err(ValidatorError::SchemaDirMissing(entry_schema));
        }
        Ok(Self { entry_schema })
    }
}

impl DocumentValidator for XsdValidator {
    fn validate(&self, doc: &[u8]) -> Result<(), ValidatorError> {
        use libxml::parser::Parser;
        use libxml::schemas::{SchemaParserContext, SchemaValidationContext};

        let entry = self
            .entry_schema
            .to_str()
            .ok_or_else(|| ValidatorError::SchemaLoad("non-utf8 schema path".to_string()))?;

        let mut parser_context = SchemaParserContext::from_file(entry);
        let mut schema = SchemaValidationContext::from_parser(&mut parser_context)
            .map_err(|errors| ValidatorError::SchemaLoad(join_errors(&errors)))?;

        let text = std::str::from_utf8(doc)
            .map_err(|err| ValidatorError::Malformed(err.to_string()))?;
        let document = Parser::default()
            .parse_string(text)
            .map_err(|err| ValidatorError::Malformed(format!("{err:?}")))?;

        schema
            .validate_document(&document)
            .map_err(|errors| ValidatorError::Violations(join_errors(&errors)))
    }
}

fn join_errors(errors: &[libxml::error::StructuredError]) -> String {
    errors
        .iter()
        .map(|err| format!("{err:?}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structural pre-flight validator.
///
/// Checks the invariants the assembler must uphold without consulting the
/// XSD set: correct root, a 44-digit key in the `infNFe` id, and the
/// mandatory blocks present. Used as an early guard and wherever the XSD
/// set is not on disk (tests, dev boxes).
pub struct StructuralValidator;

/// Blocks every NFC-e must carry, in schema order.
const REQUIRED_BLOCKS: &[&str] = &["ide", "emit", "det", "total", "transp", "pag"];

impl DocumentValidator for StructuralValidator {
    fn validate(&self, doc: &[u8]) -> Result<(), ValidatorError> {
        let id = c14n::element_attr(doc, "infNFe", "Id")
            .map_err(|err| ValidatorError::Malformed(err.to_string()))?
            .ok_or_else(|| ValidatorError::Violations("infNFe element missing".to_string()))?;

        let key = id.strip_prefix("NFe").ok_or_else(|| {
            ValidatorError::Violations(format!("infNFe Id `{id}` lacks the NFe prefix"))
        })?;
        if key.len() != 44 || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidatorError::Violations(format!(
                "infNFe Id `{id}` does not embed a 44-digit key"
            )));
        }

        let version = c14n::element_attr(doc, "infNFe", "versao")
            .map_err(|err| ValidatorError::Malformed(err.to_string()))?;
        if version.as_deref() != Some(super::SCHEMA_VERSION) {
            return Err(ValidatorError::Violations(
                "infNFe versao is not 4.00".to_string(),
            ));
        }

        for block in REQUIRED_BLOCKS {
            let present = c14n::element_present(doc, block)
                .map_err(|err| ValidatorError::Malformed(err.to_string()))?;
            if !present {
                return Err(ValidatorError::Violations(format!(
                    "mandatory block <{block}> missing"
                )));
            }
        }
        Ok(())
    }
}

/// Downloads the official schema set into `schema_dir`.
///
/// Existing files are overwritten; the directory is created when absent.
///
/// # Errors
///
/// [`ValidatorError::Download`] on the first transfer or write failure.
pub async fn refresh_schemas(
    client: &reqwest::Client,
    schema_dir: impl AsRef<Path>,
) -> Result<usize, ValidatorError> {
    let dir = schema_dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| ValidatorError::Download(err.to_string()))?;

    for file in SCHEMA_FILES {
        let url = format!("{SCHEMA_BASE_URL}/{file}");
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|err| ValidatorError::Download(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ValidatorError::Download(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ValidatorError::Download(err.to_string()))?;
        tokio::fs::write(dir.join(file), &body)
            .await
            .map_err(|err| ValidatorError::Download(err.to_string()))?;
    }
    Ok(SCHEMA_FILES.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::assembler::{build_document, sample_access_key, sample_input};
    use crate::model::{sample_company, sample_payload};

    #[test]
    fn structural_validator_accepts_assembled_document() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let doc = build_document(&sample_input(&payload, &company, &key)).unwrap();
        StructuralValidator.validate(&doc).unwrap();
    }

    #[test]
    fn structural_validator_rejects_missing_blocks() {
        let doc = b"<NFe xmlns=\"urn:x\"><infNFe Id=\"NFe\" versao=\"4.00\"></infNFe></NFe>";
        assert!(matches!(
            StructuralValidator.validate(doc),
            Err(ValidatorError::Violations(_))
        ));
    }

    #[test]
    fn structural_validator_rejects_bad_key_length() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let doc = build_document(&sample_input(&payload, &company, &key)).unwrap();
        let truncated = String::from_utf8(doc)
            .unwrap()
            .replace(&format!("NFe{key}"), "NFe123");
        assert!(matches!(
            StructuralValidator.validate(truncated.as_bytes()),
            Err(ValidatorError::Violations(_))
        ));
    }

    #[test]
    fn xsd_validator_requires_schema_dir() {
        let missing = XsdValidator::new("/nonexistent/schemas");
        assert!(matches!(
            missing,
            Err(ValidatorError::SchemaDirMissing(_))
        ));
    }
}
