//! The fiscal document layer: everything between a normalized payload and a
//! signed, validated, archivable NFC-e.

pub mod access_key;
pub mod assembler;
pub mod c14n;
pub mod danfe;
pub mod keymat;
pub mod qr;
pub mod signer;
pub mod validator;

/// XML namespace of every NFe v4.00 document.
pub const NFE_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe";

/// XML namespace of XMLDSig elements.
pub const DSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Schema version emitted and accepted by the authority.
pub const SCHEMA_VERSION: &str = "4.00";
