//! The 44-digit access key and its check digit.
//!
//! Layout: `cUF(2) yymm(4) cnpj(14) mod=65(2) serie(3) nNF(9) tpEmis(1)
//! cNF(8) dv(1)`. The check digit weighs the 43-digit prefix with weights
//! cycling 2..9 from right to left, modulo 11; remainders 0 and 1 collapse
//! to 0.

use chrono::{DateTime, FixedOffset};
use rand::Rng;
use thiserror::Error;

use crate::model::Uf;

/// Document model for consumer receipts.
const MODEL: &str = "65";

/// Errors building an access key.
#[derive(Debug, Error)]
pub enum AccessKeyError {
    /// The issuer tax id did not contain exactly 14 digits.
    #[error("cnpj must contain exactly 14 digits")]
    BadCnpj,
}

/// Inputs identifying one emission attempt.
#[derive(Debug, Clone)]
pub struct AccessKeyParts<'a> {
    /// Emitter state.
    pub uf: Uf,
    /// Issuer CNPJ; non-digits are stripped.
    pub cnpj: &'a str,
    /// Document series.
    pub series: u16,
    /// Document number.
    pub number: i64,
    /// `tpEmis` digit: `1` normal, `6` SVC-AN, `7` SVC-RS.
    pub emission_kind: &'a str,
    /// Random 8-digit code (`cNF`).
    pub random_code: u32,
    /// Emission timestamp; only year and month participate.
    pub issued_at: DateTime<FixedOffset>,
}

/// Builds the full 44-character key, check digit included.
///
/// # Errors
///
/// Returns [`AccessKeyError::BadCnpj`] when the tax id does not hold 14
/// digits after stripping separators.
pub fn build(parts: &AccessKeyParts<'_>) -> Result<String, AccessKeyError> {
    let digits: String = parts.cnpj.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 14 {
        return Err(AccessKeyError::BadCnpj);
    }

    let prefix = format!(
        "{cuf}{yymm}{cnpj}{model}{series:03}{number:09}{kind}{random:08}",
        cuf = parts.uf.ibge_code(),
        yymm = parts.issued_at.format("%y%m"),
        cnpj = digits,
        model = MODEL,
        series = parts.series,
        number = parts.number,
        kind = parts.emission_kind,
        random = parts.random_code,
    );
    debug_assert_eq!(prefix.len(), 43);

    let dv = check_digit(&prefix);
    Ok(format!("{prefix}{dv}"))
}

/// Computes the check digit of a 43-digit prefix.
///
/// Inputs of any other length yield `0`, matching the authority's treatment
/// of malformed keys.
#[must_use]
pub fn check_digit(prefix: &str) -> u8 {
    if prefix.len() != 43 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }

    let weights = [2u32, 3, 4, 5, 6, 7, 8, 9];
    let total: u32 = prefix
        .bytes()
        .rev()
        .enumerate()
        .map(|(pos, byte)| u32::from(byte - b'0') * weights[pos % 8])
        .sum();

    let remainder = total % 11;
    if remainder <= 1 {
        0
    } else {
        (11 - remainder) as u8
    }
}

/// Whether a 44-character key carries a consistent check digit.
#[must_use]
pub fn verify(key: &str) -> bool {
    if key.len() != 44 || !key.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let (prefix, dv) = key.split_at(43);
    dv.as_bytes()[0] - b'0' == check_digit(prefix)
}

/// Draws a fresh 8-digit random code (`cNF`), never zero.
#[must_use]
pub fn random_code() -> u32 {
    rand::thread_rng().gen_range(1..=99_999_999)
}
