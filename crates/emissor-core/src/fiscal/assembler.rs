//! Assembles the v4.00 NFC-e document tree from a normalized payload.
//!
//! The output is already in canonical form: UTF-8, no insignificant
//! whitespace, attributes written in canonical order. Tax values are caller
//! inputs; this module only formats and sums them.

use chrono::{DateTime, FixedOffset};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;
use thiserror::Error;

use super::{NFE_NAMESPACE, SCHEMA_VERSION};
use crate::model::{Company, ContingencyKind, Item, Payment, SalePayload};

/// Errors while serializing the document tree.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// The XML writer refused an event.
    #[error("xml write failed: {0}")]
    Write(String),
}

/// How the document is being emitted.
#[derive(Debug, Clone, Copy)]
pub enum EmissionKind<'a> {
    /// Normal emission against the emitter state's own authority.
    Normal,
    /// Emission against a contingency authority.
    Contingency {
        /// Which contingency family.
        kind: ContingencyKind,
        /// When the system entered contingency (`dhCont`).
        since: DateTime<FixedOffset>,
        /// Justification (`xJust`), 15..=256 chars.
        justification: &'a str,
    },
}

impl EmissionKind<'_> {
    /// The `tpEmis` digit for this emission.
    #[must_use]
    pub const fn tp_emis(&self) -> &'static str {
        match self {
            Self::Normal => "1",
            Self::Contingency { kind, .. } => kind.tp_emis(),
        }
    }
}

/// Everything the assembler needs for one document.
pub struct DocumentInput<'a> {
    /// The sale payload.
    pub payload: &'a SalePayload,
    /// The issuing company (name and address block).
    pub company: &'a Company,
    /// Pre-computed 44-digit access key.
    pub access_key: &'a str,
    /// Issued document number (`nNF`).
    pub number: i64,
    /// Document series.
    pub series: u16,
    /// Random code used in the access key (`cNF`).
    pub random_code: u32,
    /// Emission timestamp (`dhEmi`), with offset.
    pub issued_at: DateTime<FixedOffset>,
    /// Normal or contingency emission.
    pub emission: EmissionKind<'a>,
    /// Emitting software version (`verProc`).
    pub software_version: &'a str,
}

/// Formats a monetary value with two decimal places.
fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

/// Formats a quantity with four decimal places.
fn quantity(value: Decimal) -> String {
    format!("{:.4}", value)
}

/// Formats a unit price with ten decimal places.
fn unit_price(value: Decimal) -> String {
    format!("{:.10}", value)
}

/// Serializer wrapper keeping the event plumbing in one place.
struct Xml {
    writer: Writer<Vec<u8>>,
}

impl Xml {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn emit(&mut self, event: Event<'_>) -> Result<(), AssembleError> {
        self.writer
            .write_event(event)
            .map_err(|err| AssembleError::Write(err.to_string()))
    }

    fn open(&mut self, name: &str) -> Result<(), AssembleError> {
        self.emit(Event::Start(BytesStart::new(name)))
    }

    fn open_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<(), AssembleError> {
        let mut start = BytesStart::new(name);
        for (key, value) in attrs {
            start.push_attribute((*key, *value));
        }
        self.emit(Event::Start(start))
    }

    fn close(&mut self, name: &str) -> Result<(), AssembleError> {
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn leaf(&mut self, name: &str, text: &str) -> Result<(), AssembleError> {
        self.open(name)?;
        self.emit(Event::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn leaf_opt(&mut self, name: &str, text: Option<&str>) -> Result<(), AssembleError> {
        match text {
            Some(value) if !value.is_empty() => self.leaf(name, value),
            _ => Ok(()),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

/// Builds the unsigned document.
///
/// # Errors
///
/// Returns [`AssembleError`] when serialization fails; the tree itself is
/// total over its inputs.
pub fn build_document(input: &DocumentInput<'_>) -> Result<Vec<u8>, AssembleError> {
    let mut xml = Xml::new();

    xml.open_with("NFe", &[("xmlns", NFE_NAMESPACE)])?;
    xml.open_with(
        "infNFe",
        &[
            ("Id", &format!("NFe{}", input.access_key)),
            ("versao", SCHEMA_VERSION),
        ],
    )?;

    write_ide(&mut xml, input)?;
    write_emit(&mut xml, input.company)?;
    write_dest(&mut xml, input.payload)?;
    for (index, item) in input.payload.items.iter().enumerate() {
        write_det(&mut xml, index + 1, item)?;
    }
    write_total(&mut xml, input.payload)?;
    xml.open("transp")?;
    xml.leaf("modFrete", "9")?;
    xml.close("transp")?;
    write_pag(&mut xml, input.payload)?;

    xml.close("infNFe")?;
    xml.close("NFe")?;

    Ok(xml.into_bytes())
}

fn write_ide(xml: &mut Xml, input: &DocumentInput<'_>) -> Result<(), AssembleError> {
    let payload = input.payload;
    let check_digit = &input.access_key[43..];

    xml.open("ide")?;
    xml.leaf("cUF", payload.uf.ibge_code())?;
    xml.leaf("cNF", &format!("{:08}", input.random_code))?;
    xml.leaf("natOp", "VENDA")?;
    xml.leaf("mod", "65")?;
    xml.leaf("serie", &input.series.to_string())?;
    xml.leaf("nNF", &input.number.to_string())?;
    xml.leaf("dhEmi", &format_datetime(input.issued_at))?;
    xml.leaf("tpNF", "1")?;
    xml.leaf("idDest", "1")?;
    xml.leaf("cMunFG", &input.company.address.municipality_code)?;
    xml.leaf("tpImp", "4")?;
    xml.leaf("tpEmis", input.emission.tp_emis())?;
    xml.leaf("cDV", check_digit)?;
    xml.leaf("tpAmb", payload.environment.tp_amb())?;
    xml.leaf("finNFe", "1")?;
    xml.leaf("indFinal", "1")?;
    xml.leaf("indPres", "1")?;
    xml.leaf("procEmi", "0")?;
    xml.leaf("verProc", input.software_version)?;
    if let EmissionKind::Contingency {
        since,
        justification,
        ..
    } = input.emission
    {
        xml.leaf("dhCont", &format_datetime(since))?;
        xml.leaf("xJust", justification)?;
    }
    xml.close("ide")
}

fn write_emit(xml: &mut Xml, company: &Company) -> Result<(), AssembleError> {
    xml.open("emit")?;
    xml.leaf("CNPJ", &company.cnpj)?;
    xml.leaf("xNome", &company.legal_name)?;
    xml.leaf_opt("xFant", company.trade_name.as_deref())?;

    let address = &company.address;
    xml.open("enderEmit")?;
    xml.leaf("xLgr", &address.street)?;
    xml.leaf("nro", &address.number)?;
    xml.leaf("xBairro", &address.district)?;
    xml.leaf("cMun", &address.municipality_code)?;
    xml.leaf("xMun", &address.municipality)?;
    xml.leaf("UF", address.uf.as_str())?;
    xml.leaf("CEP", &address.postal_code)?;
    xml.leaf("cPais", "1058")?;
    xml.leaf("xPais", "BRASIL")?;
    xml.leaf_opt("fone", address.phone.as_deref())?;
    xml.close("enderEmit")?;

    xml.leaf("IE", &company.ie)?;
    xml.leaf("CRT", &company.crt)?;
    xml.close("emit")
}

fn write_dest(xml: &mut Xml, payload: &SalePayload) -> Result<(), AssembleError> {
    let Some(tax_id) = payload.consumer_tax_id.as_deref() else {
        return Ok(());
    };
    let digits: String = tax_id.chars().filter(char::is_ascii_digit).collect();

    xml.open("dest")?;
    if digits.len() == 14 {
        xml.leaf("CNPJ", &digits)?;
    } else {
        xml.leaf("CPF", &digits)?;
    }
    xml.leaf("indIEDest", "9")?;
    xml.close("dest")
}

fn write_det(xml: &mut Xml, line: usize, item: &Item) -> Result<(), AssembleError> {
    let gtin = item.gtin.as_deref().unwrap_or("SEM GTIN");
    let product_code = item.gtin.as_deref().unwrap_or(&item.ncm);

    xml.open_with("det", &[("nItem", &line.to_string())])?;

    xml.open("prod")?;
    xml.leaf("cProd", product_code)?;
    xml.leaf("cEAN", gtin)?;
    xml.leaf("xProd", &item.description)?;
    xml.leaf("NCM", &item.ncm)?;
    xml.leaf("CFOP", &item.cfop)?;
    xml.leaf("uCom", &item.unit)?;
    xml.leaf("qCom", &quantity(item.quantity))?;
    xml.leaf("vUnCom", &unit_price(item.unit_price))?;
    xml.leaf("vProd", &money(item.total()))?;
    xml.leaf("cEANTrib", gtin)?;
    xml.leaf("uTrib", &item.unit)?;
    xml.leaf("qTrib", &quantity(item.quantity))?;
    xml.leaf("vUnTrib", &unit_price(item.unit_price))?;
    xml.leaf("indTot", "1")?;
    xml.close("prod")?;

    write_imposto(xml, item)?;
    xml.close("det")
}

/// Maps the ICMS situation code to its schema group element.
fn icms_group(cst: &str) -> &'static str {
    match cst {
        "00" => "ICMS00",
        "20" => "ICMS20",
        "40" | "41" | "50" => "ICMS40",
        "60" => "ICMS60",
        "101" => "ICMSSN101",
        "102" | "103" | "300" | "400" => "ICMSSN102",
        "500" => "ICMSSN500",
        "900" => "ICMSSN900",
        _ if cst.len() == 3 => "ICMSSN900",
        _ => "ICMS90",
    }
}

fn write_imposto(xml: &mut Xml, item: &Item) -> Result<(), AssembleError> {
    let taxes = &item.taxes;
    let origin = if taxes.icms_origin.is_empty() {
        "0"
    } else {
        &taxes.icms_origin
    };
    let icms_cst = if taxes.icms_cst.is_empty() {
        "102"
    } else {
        &taxes.icms_cst
    };
    let group = icms_group(icms_cst);
    let simples = group.starts_with("ICMSSN");

    xml.open("imposto")?;

    xml.open("ICMS")?;
    xml.open(group)?;
    xml.leaf("orig", origin)?;
    xml.leaf(if simples { "CSOSN" } else { "CST" }, icms_cst)?;
    if let (Some(base), Some(rate), Some(value)) =
        (taxes.icms_base, taxes.icms_rate, taxes.icms_value)
    {
        xml.leaf("modBC", "3")?;
        xml.leaf("vBC", &money(base))?;
        xml.leaf("pICMS", &format!("{:.4}", rate))?;
        xml.leaf("vICMS", &money(value))?;
    }
    xml.close(group)?;
    xml.close("ICMS")?;

    xml.open("PIS")?;
    if let Some(value) = taxes.pis_value {
        xml.open("PISAliq")?;
        xml.leaf("CST", if taxes.pis_cst.is_empty() { "01" } else { &taxes.pis_cst })?;
        xml.leaf("vBC", &money(taxes.pis_base.unwrap_or(Decimal::ZERO)))?;
        xml.leaf("pPIS", &format!("{:.4}", taxes.pis_rate.unwrap_or(Decimal::ZERO)))?;
        xml.leaf("vPIS", &money(value))?;
        xml.close("PISAliq")?;
    } else {
        xml.open("PISNT")?;
        xml.leaf("CST", if taxes.pis_cst.is_empty() { "07" } else { &taxes.pis_cst })?;
        xml.close("PISNT")?;
    }
    xml.close("PIS")?;

    xml.open("COFINS")?;
    if let Some(value) = taxes.cofins_value {
        xml.open("COFINSAliq")?;
        xml.leaf(
            "CST",
            if taxes.cofins_cst.is_empty() { "01" } else { &taxes.cofins_cst },
        )?;
        xml.leaf("vBC", &money(taxes.cofins_base.unwrap_or(Decimal::ZERO)))?;
        xml.leaf(
            "pCOFINS",
            &format!("{:.4}", taxes.cofins_rate.unwrap_or(Decimal::ZERO)),
        )?;
        xml.leaf("vCOFINS", &money(value))?;
        xml.close("COFINSAliq")?;
    } else {
        xml.open("COFINSNT")?;
        xml.leaf(
            "CST",
            if taxes.cofins_cst.is_empty() { "07" } else { &taxes.cofins_cst },
        )?;
        xml.close("COFINSNT")?;
    }
    xml.close("COFINS")?;

    xml.close("imposto")
}

fn write_total(xml: &mut Xml, payload: &SalePayload) -> Result<(), AssembleError> {
    let zero = money(Decimal::ZERO);
    let base_total: Decimal = payload
        .items
        .iter()
        .filter_map(|i| i.taxes.icms_base)
        .sum();
    let pis_total: Decimal = payload
        .items
        .iter()
        .filter_map(|i| i.taxes.pis_value)
        .sum();
    let cofins_total: Decimal = payload
        .items
        .iter()
        .filter_map(|i| i.taxes.cofins_value)
        .sum();

    xml.open("total")?;
    xml.open("ICMSTot")?;
    xml.leaf("vBC", &money(base_total))?;
    xml.leaf("vICMS", &money(payload.icms_total()))?;
    xml.leaf("vICMSDeson", &zero)?;
    xml.leaf("vFCP", &zero)?;
    xml.leaf("vBCST", &zero)?;
    xml.leaf("vST", &zero)?;
    xml.leaf("vFCPST", &zero)?;
    xml.leaf("vFCPSTRet", &zero)?;
    xml.leaf("vProd", &money(payload.items_total()))?;
    xml.leaf("vFrete", &zero)?;
    xml.leaf("vSeg", &zero)?;
    xml.leaf("vDesc", &zero)?;
    xml.leaf("vII", &zero)?;
    xml.leaf("vIPI", &zero)?;
    xml.leaf("vIPIDevol", &zero)?;
    xml.leaf("vPIS", &money(pis_total))?;
    xml.leaf("vCOFINS", &money(cofins_total))?;
    xml.leaf("vOutro", &zero)?;
    xml.leaf("vNF", &money(payload.items_total()))?;
    xml.close("ICMSTot")?;
    xml.close("total")
}

fn write_pag(xml: &mut Xml, payload: &SalePayload) -> Result<(), AssembleError> {
    xml.open("pag")?;
    for payment in &payload.payments {
        write_det_pag(xml, payment)?;
    }
    let change = payload.payments_total() - payload.items_total();
    if change > Decimal::ZERO {
        xml.leaf("vTroco", &money(change))?;
    }
    xml.close("pag")
}

fn write_det_pag(xml: &mut Xml, payment: &Payment) -> Result<(), AssembleError> {
    xml.open("detPag")?;
    xml.leaf("tPag", &payment.method)?;
    xml.leaf("vPag", &money(payment.amount))?;
    if let Some(card) = &payment.card {
        xml.open("card")?;
        xml.leaf("tpIntegra", &card.integration)?;
        xml.leaf_opt("CNPJ", card.acquirer_cnpj.as_deref())?;
        xml.leaf_opt("tBand", card.brand.as_deref())?;
        xml.leaf_opt("cAut", card.authorization.as_deref())?;
        xml.close("card")?;
    }
    xml.close("detPag")
}

fn format_datetime(value: DateTime<FixedOffset>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// A fixed emission timestamp shared by tests across the crate.
#[cfg(test)]
pub(crate) fn sample_issued_at() -> DateTime<FixedOffset> {
    use chrono::TimeZone;
    FixedOffset::west_opt(3 * 3600)
        .unwrap()
        .with_ymd_and_hms(2026, 8, 2, 10, 30, 0)
        .unwrap()
}

/// A ready-to-assemble input over the given payload/company pair.
#[cfg(test)]
pub(crate) fn sample_input<'a>(
    payload: &'a SalePayload,
    company: &'a Company,
    access_key: &'a str,
) -> DocumentInput<'a> {
    DocumentInput {
        payload,
        company,
        access_key,
        number: 42,
        series: 1,
        random_code: 7_654_321,
        issued_at: sample_issued_at(),
        emission: EmissionKind::Normal,
        software_version: "emissor 0.3.0",
    }
}

/// The access key matching [`sample_input`].
#[cfg(test)]
pub(crate) fn sample_access_key(payload: &SalePayload) -> String {
    use crate::fiscal::access_key::{self, AccessKeyParts};

    access_key::build(&AccessKeyParts {
        uf: payload.uf,
        cnpj: &payload.issuer.cnpj,
        series: 1,
        number: 42,
        emission_kind: "1",
        random_code: 7_654_321,
        issued_at: sample_issued_at(),
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::{sample_company, sample_payload};

    #[test]
    fn document_shape() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let doc = build_document(&sample_input(&payload, &company, &key)).unwrap();
        let text = String::from_utf8(doc).unwrap();

        assert!(text.starts_with("<NFe xmlns=\"http://www.portalfiscal.inf.br/nfe\">"));
        assert!(text.contains(&format!("<infNFe Id=\"NFe{key}\" versao=\"4.00\">")));
        assert!(text.contains("<mod>65</mod>"));
        assert!(text.contains("<tpEmis>1</tpEmis>"));
        assert!(text.contains("<qCom>1.0000</qCom>"));
        assert!(text.contains("<vUnCom>29.9000000000</vUnCom>"));
        assert!(text.contains("<vProd>29.90</vProd>"));
        assert!(text.contains("<vNF>29.90</vNF>"));
        assert!(text.contains("<tPag>01</tPag>"));
        assert!(text.ends_with("</infNFe></NFe>"));
        // Check digit of the key is mirrored in cDV.
        assert!(text.contains(&format!("<cDV>{}</cDV>", &key[43..])));
        // No declaration, no whitespace between elements.
        assert!(!text.contains('\n'));
    }

    #[test]
    fn contingency_adds_justification_block() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let mut input = sample_input(&payload, &company, &key);
        input.emission = EmissionKind::Contingency {
            kind: ContingencyKind::SvcAn,
            since: input.issued_at,
            justification: "Falha de comunicacao com a SEFAZ de origem",
        };

        let text = String::from_utf8(build_document(&input).unwrap()).unwrap();
        assert!(text.contains("<tpEmis>6</tpEmis>"));
        assert!(text.contains("<dhCont>"));
        assert!(text.contains("<xJust>Falha de comunicacao com a SEFAZ de origem</xJust>"));
    }

    #[test]
    fn change_is_emitted_when_payments_exceed_total() {
        let mut payload = sample_payload();
        payload.payments[0].amount = dec!(50.00);
        // Keep intake tolerance out of the way; the assembler itself does
        // not validate.
        let company = sample_company();
        let key = sample_access_key(&payload);
        let text =
            String::from_utf8(build_document(&sample_input(&payload, &company, &key)).unwrap())
                .unwrap();
        assert!(text.contains("<vTroco>20.10</vTroco>"));
    }

    #[test]
    fn missing_gtin_uses_sem_gtin_marker() {
        let payload = sample_payload();
        let company = sample_company();
        let key = sample_access_key(&payload);
        let text =
            String::from_utf8(build_document(&sample_input(&payload, &company, &key)).unwrap())
                .unwrap();
        assert!(text.contains("<cEAN>SEM GTIN</cEAN>"));
        assert!(text.contains("<cEANTrib>SEM GTIN</cEANTrib>"));
    }
}
