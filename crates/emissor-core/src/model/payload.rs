//! The normalized sale payload accepted by intake.
//!
//! The payload is immutable once persisted; tax values are caller inputs and
//! are never derived here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EmissionError;

/// Brazilian federative units recognized by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Uf {
    AC, AL, AP, AM, BA, CE, DF, ES, GO, MA, MT, MS, MG, PA,
    PB, PR, PE, PI, RJ, RN, RS, RO, RR, SC, SP, SE, TO,
}

impl Uf {
    /// Two-letter abbreviation, as carried in the XML `UF` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AC => "AC", Self::AL => "AL", Self::AP => "AP", Self::AM => "AM",
            Self::BA => "BA", Self::CE => "CE", Self::DF => "DF", Self::ES => "ES",
            Self::GO => "GO", Self::MA => "MA", Self::MT => "MT", Self::MS => "MS",
            Self::MG => "MG", Self::PA => "PA", Self::PB => "PB", Self::PR => "PR",
            Self::PE => "PE", Self::PI => "PI", Self::RJ => "RJ", Self::RN => "RN",
            Self::RS => "RS", Self::RO => "RO", Self::RR => "RR", Self::SC => "SC",
            Self::SP => "SP", Self::SE => "SE", Self::TO => "TO",
        }
    }

    /// IBGE numeric code (`cUF`), two digits.
    #[must_use]
    pub fn ibge_code(self) -> &'static str {
        match self {
            Self::AC => "12", Self::AL => "27", Self::AP => "16", Self::AM => "13",
            Self::BA => "29", Self::CE => "23", Self::DF => "53", Self::ES => "32",
            Self::GO => "52", Self::MA => "21", Self::MT => "51", Self::MS => "50",
            Self::MG => "31", Self::PA => "15", Self::PB => "25", Self::PR => "41",
            Self::PE => "26", Self::PI => "22", Self::RJ => "33", Self::RN => "24",
            Self::RS => "43", Self::RO => "11", Self::RR => "14", Self::SC => "42",
            Self::SP => "35", Self::SE => "28", Self::TO => "17",
        }
    }

    /// IBGE municipality code of the state capital, used as `cMunFG` when
    /// the payload does not carry an explicit municipality.
    #[must_use]
    pub fn capital_municipality(self) -> &'static str {
        match self {
            Self::AC => "1200401", Self::AL => "2704302", Self::AP => "1600303",
            Self::AM => "1302603", Self::BA => "2927408", Self::CE => "2304400",
            Self::DF => "5300108", Self::ES => "3205309", Self::GO => "5208707",
            Self::MA => "2111300", Self::MT => "5103403", Self::MS => "5002704",
            Self::MG => "3106200", Self::PA => "1501402", Self::PB => "2507507",
            Self::PR => "4106902", Self::PE => "2611606", Self::PI => "2211001",
            Self::RJ => "3304557", Self::RN => "2408102", Self::RS => "4314902",
            Self::RO => "1100205", Self::RR => "1400100", Self::SC => "4205407",
            Self::SP => "3550308", Self::SE => "2800308", Self::TO => "1721000",
        }
    }
}

impl std::str::FromStr for Uf {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown UF `{s}`"))
    }
}

/// Emission environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Live documents with fiscal value.
    Production,
    /// Authority test environment.
    Homologation,
}

impl Environment {
    /// Value of the XML/QR `tpAmb` field.
    #[must_use]
    pub const fn tp_amb(self) -> &'static str {
        match self {
            Self::Production => "1",
            Self::Homologation => "2",
        }
    }
}

/// Issuer identification carried in the payload.
///
/// Name and address come from the company record; the payload carries the
/// tax identifiers and the contributor secret reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleIssuer {
    /// Issuer CNPJ, 14 digits.
    pub cnpj: String,
    /// State registration (`IE`).
    #[serde(default)]
    pub ie: String,
    /// Tax regime code (`CRT`), e.g. `1` for Simples Nacional.
    #[serde(default = "default_crt")]
    pub crt: String,
    /// Contributor-secret public identifier (`cIdToken`).
    pub csc_id: String,
    /// Contributor-secret token. Never logged; used only to hash the QR
    /// payload.
    pub csc_token: String,
}

fn default_crt() -> String {
    "1".to_string()
}

/// Per-item tax values. All values are inputs; the assembler only sums them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemTaxes {
    /// ICMS situation code (CST or CSOSN).
    #[serde(default)]
    pub icms_cst: String,
    /// ICMS origin digit.
    #[serde(default)]
    pub icms_origin: String,
    /// ICMS calculation base.
    #[serde(default)]
    pub icms_base: Option<Decimal>,
    /// ICMS rate, percent.
    #[serde(default)]
    pub icms_rate: Option<Decimal>,
    /// ICMS value.
    #[serde(default)]
    pub icms_value: Option<Decimal>,
    /// PIS situation code.
    #[serde(default)]
    pub pis_cst: String,
    /// PIS calculation base.
    #[serde(default)]
    pub pis_base: Option<Decimal>,
    /// PIS rate, percent.
    #[serde(default)]
    pub pis_rate: Option<Decimal>,
    /// PIS value.
    #[serde(default)]
    pub pis_value: Option<Decimal>,
    /// COFINS situation code.
    #[serde(default)]
    pub cofins_cst: String,
    /// COFINS calculation base.
    #[serde(default)]
    pub cofins_base: Option<Decimal>,
    /// COFINS rate, percent.
    #[serde(default)]
    pub cofins_rate: Option<Decimal>,
    /// COFINS value.
    #[serde(default)]
    pub cofins_value: Option<Decimal>,
}

/// One sale line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Product description.
    pub description: String,
    /// Mercosur tariff code.
    pub ncm: String,
    /// Fiscal operation code.
    pub cfop: String,
    /// Barcode (GTIN), when the product has one.
    #[serde(default)]
    pub gtin: Option<String>,
    /// Commercial unit, e.g. `UN`.
    pub unit: String,
    /// Quantity, up to four decimal places.
    pub quantity: Decimal,
    /// Unit price, up to ten decimal places.
    pub unit_price: Decimal,
    /// Tax inputs for this line.
    #[serde(default)]
    pub taxes: ItemTaxes,
}

impl Item {
    /// Line total (`vProd`), rounded to two decimals.
    #[must_use]
    pub fn total(&self) -> Decimal {
        (self.quantity * self.unit_price).round_dp(2)
    }
}

/// Card details for card payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCard {
    /// Integration kind (`tpIntegra`).
    pub integration: String,
    /// Acquirer CNPJ.
    #[serde(default)]
    pub acquirer_cnpj: Option<String>,
    /// Card brand code (`tBand`).
    #[serde(default)]
    pub brand: Option<String>,
    /// Authorization code (`cAut`).
    #[serde(default)]
    pub authorization: Option<String>,
}

/// One payment entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Payment means code (`tPag`), e.g. `01` cash.
    pub method: String,
    /// Amount paid.
    pub amount: Decimal,
    /// Card details when applicable.
    #[serde(default)]
    pub card: Option<PaymentCard>,
}

/// The normalized payload submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalePayload {
    /// Issuing company reference.
    pub company_id: Uuid,
    /// Emitter state.
    pub uf: Uf,
    /// Emission environment.
    pub environment: Environment,
    /// Issuer identification.
    pub issuer: SaleIssuer,
    /// Line items; at least one.
    pub items: Vec<Item>,
    /// Payments; must cover the item total.
    pub payments: Vec<Payment>,
    /// Document series; defaults to 1.
    #[serde(default = "default_series")]
    pub series: u16,
    /// Optional consumer tax id (CPF/CNPJ) for the QR `dest` field.
    #[serde(default)]
    pub consumer_tax_id: Option<String>,
}

fn default_series() -> u16 {
    1
}

/// Tolerance when matching payments against the item total: one cent.
fn payment_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

impl SalePayload {
    /// Sum of all line totals.
    #[must_use]
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(Item::total).sum()
    }

    /// Sum of all payment amounts.
    #[must_use]
    pub fn payments_total(&self) -> Decimal {
        self.payments.iter().map(|p| p.amount).sum()
    }

    /// Sum of ICMS values across items (`vICMS` total).
    #[must_use]
    pub fn icms_total(&self) -> Decimal {
        self.items
            .iter()
            .filter_map(|i| i.taxes.icms_value)
            .sum::<Decimal>()
            .round_dp(2)
    }

    /// Validates the payload at intake.
    ///
    /// # Errors
    ///
    /// Returns [`EmissionError::Validation`] describing the first problem
    /// found: no items, a negative payment, or a payment sum that does not
    /// match the item total within ±0.01.
    pub fn validate(&self) -> Result<(), EmissionError> {
        if self.items.is_empty() {
            return Err(EmissionError::Validation(
                "payload must contain at least one item".to_string(),
            ));
        }
        if self.issuer.cnpj.chars().filter(char::is_ascii_digit).count() != 14 {
            return Err(EmissionError::Validation(
                "issuer cnpj must contain 14 digits".to_string(),
            ));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.quantity <= Decimal::ZERO {
                return Err(EmissionError::Validation(format!(
                    "item {idx}: quantity must be positive"
                )));
            }
            if item.unit_price < Decimal::ZERO {
                return Err(EmissionError::Validation(format!(
                    "item {idx}: unit price must not be negative"
                )));
            }
        }
        for (idx, payment) in self.payments.iter().enumerate() {
            if payment.amount < Decimal::ZERO {
                return Err(EmissionError::Validation(format!(
                    "payment {idx}: amount must not be negative"
                )));
            }
        }
        let delta = (self.payments_total() - self.items_total()).abs();
        if delta > payment_tolerance() {
            return Err(EmissionError::Validation(format!(
                "payments ({}) do not match item total ({})",
                self.payments_total(),
                self.items_total()
            )));
        }
        Ok(())
    }

    /// Stable SHA-256 hash of the serialized payload, hex-encoded.
    ///
    /// Used to detect an idempotency-key replay that carries different data.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("payload serialization is infallible");
        hex::encode(Sha256::digest(&bytes))
    }
}

/// A minimal, valid homologation payload for tests across the crate.
#[cfg(test)]
pub(crate) fn sample_payload() -> SalePayload {
    use rust_decimal_macros::dec;

    SalePayload {
        company_id: Uuid::new_v4(),
        uf: Uf::SP,
        environment: Environment::Homologation,
        issuer: SaleIssuer {
            cnpj: "12345678000195".to_string(),
            ie: "1234567890".to_string(),
            crt: "1".to_string(),
            csc_id: "000001".to_string(),
            csc_token: "TOKEN".to_string(),
        },
        items: vec![Item {
            description: "CANETA ESFEROGRAFICA".to_string(),
            ncm: "84713019".to_string(),
            cfop: "5102".to_string(),
            gtin: None,
            unit: "UN".to_string(),
            quantity: dec!(1),
            unit_price: dec!(29.90),
            taxes: ItemTaxes::default(),
        }],
        payments: vec![Payment {
            method: "01".to_string(),
            amount: dec!(29.90),
            card: None,
        }],
        series: 1,
        consumer_tax_id: None,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn sample_payload() -> SalePayload {
        super::sample_payload()
    }

    #[test]
    fn valid_payload_passes() {
        sample_payload().validate().unwrap();
    }

    #[test]
    fn rejects_empty_items() {
        let mut payload = sample_payload();
        payload.items.clear();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn rejects_payment_mismatch() {
        let mut payload = sample_payload();
        payload.payments[0].amount = dec!(10.00);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn tolerates_one_cent_difference() {
        let mut payload = sample_payload();
        payload.payments[0].amount = dec!(29.91);
        payload.validate().unwrap();
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let payload = sample_payload();
        assert_eq!(payload.content_hash(), payload.content_hash());

        let mut other = payload.clone();
        other.items[0].unit_price = dec!(29.91);
        assert_ne!(payload.content_hash(), other.content_hash());
    }

    #[test]
    fn uf_tables_agree() {
        assert_eq!(Uf::SP.ibge_code(), "35");
        assert_eq!(Uf::RS.ibge_code(), "43");
        assert_eq!(Uf::SP.capital_municipality(), "3550308");
        assert_eq!("RS".parse::<Uf>().unwrap(), Uf::RS);
        assert!("XX".parse::<Uf>().is_err());
    }
}
