//! QR Code v3 URL and image, per the 2025.001 technical note.
//!
//! The consumer-facing URL carries the access key plus a SHA-1 hash of the
//! canonical payload salted with the contributor-secret token. The token
//! itself never leaves this module.

use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

use crate::model::{ContributorSecret, Environment, Uf};

/// QR layout version emitted (`nVersao`).
const QR_VERSION: &str = "3";

/// Errors rendering the QR artifacts.
#[derive(Debug, Error)]
pub enum QrError {
    /// The per-state base URL could not be parsed.
    #[error("invalid base url: {0}")]
    BadBaseUrl(String),

    /// The QR matrix could not be built or encoded.
    #[error("qr image rendering failed: {0}")]
    Render(String),
}

/// Inputs for one QR URL.
pub struct QrInput<'a> {
    /// The 44-digit access key (`chNFe`).
    pub access_key: &'a str,
    /// Emission environment (`tpAmb`).
    pub environment: Environment,
    /// Consumer tax id (`dest`), when the sale identified one.
    pub consumer_tax_id: Option<&'a str>,
    /// Emission timestamp exactly as serialized in the XML (`dhEmi`).
    pub issued_at: &'a str,
    /// Document total (`vNF`).
    pub total: Decimal,
    /// ICMS total (`vICMS`).
    pub icms_total: Decimal,
    /// Base64 `DigestValue` lifted from the signed XML (`digVal`).
    pub digest_value: &'a str,
    /// Contributor secret (`cIdToken` + token).
    pub csc: &'a ContributorSecret,
    /// Emitter state, selects the base URL.
    pub uf: Uf,
}

/// Builds the consumer-facing QR URL.
///
/// # Errors
///
/// [`QrError::BadBaseUrl`] when the per-state base URL table carries an
/// unparseable entry (a programming error surfaced instead of panicking).
pub fn build_url(input: &QrInput<'_>) -> Result<String, QrError> {
    let total = format!("{:.2}", input.total);
    let icms = format!("{:.2}", input.icms_total);
    let dest = input.consumer_tax_id.unwrap_or("");

    // chNFe|tpAmb|dest|dhEmi|vNF|vICMS|digVal|cIdToken
    let payload = [
        input.access_key,
        input.environment.tp_amb(),
        dest,
        input.issued_at,
        &total,
        &icms,
        input.digest_value,
        &input.csc.id,
    ]
    .join("|");

    let mut hasher = Sha1::new();
    hasher.update(payload.as_bytes());
    hasher.update(input.csc.token.expose_secret().as_bytes());
    let hash = hex::encode_upper(hasher.finalize());

    let base = base_url(input.uf, input.environment);
    let mut url = Url::parse(base).map_err(|err| QrError::BadBaseUrl(err.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("chNFe", input.access_key);
        query.append_pair("nVersao", QR_VERSION);
        query.append_pair("tpAmb", input.environment.tp_amb());
        if !dest.is_empty() {
            query.append_pair("dest", dest);
        }
        query.append_pair("dhEmi", input.issued_at);
        query.append_pair("vNF", &total);
        query.append_pair("vICMS", &icms);
        query.append_pair("digVal", input.digest_value);
        query.append_pair("cIdToken", &input.csc.id);
        query.append_pair("cHashQRCode", &hash);
    }
    Ok(url.into())
}

/// Renders the URL as a PNG, at least 256px on a side.
///
/// # Errors
///
/// [`QrError::Render`] when the content does not fit a QR matrix or PNG
/// encoding fails.
pub fn render_png(qr_url: &str) -> Result<Vec<u8>, QrError> {
    let code = qrcode::QrCode::new(qr_url.as_bytes())
        .map_err(|err| QrError::Render(err.to_string()))?;
    let rendered = code
        .render::<image::Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let mut png = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut png);
    image::DynamicImage::ImageLuma8(rendered)
        .write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|err| QrError::Render(err.to_string()))?;
    Ok(png)
}

/// Per-state consultation base URL.
fn base_url(uf: Uf, environment: Environment) -> &'static str {
    // Most states expose a single host for both environments; the ones that
    // differ are matched on the pair.
    match (uf, environment) {
        (Uf::AC, _) => "https://www.sefaznet.ac.gov.br/nfce/qrcode",
        (Uf::AL, _) => "https://nfce.sefaz.al.gov.br/QRCode/consultarNFCe.jsp",
        (Uf::AP, _) => "https://www.sefaz.ap.gov.br/nfce/nfcep.php",
        (Uf::AM, _) => "https://www.sefaz.am.gov.br/nfce/qrcode",
        (Uf::BA, _) => "https://nfce.sefaz.ba.gov.br/servicos/nfce/default.aspx",
        (Uf::CE, _) => "https://nfce.sefaz.ce.gov.br/pages/ShowNFCe.html",
        (Uf::DF, _) => "https://www.fazenda.df.gov.br/nfce/qrcode",
        (Uf::ES, _) => "https://www.sefaz.es.gov.br/nfce/qrcode",
        (Uf::GO, _) => "https://nfce.sefaz.go.gov.br/nfce/qrcode",
        (Uf::MA, _) => "https://www.sefaz.ma.gov.br/nfce/qrcode",
        (Uf::MT, _) => "https://www.sefaz.mt.gov.br/nfce/qrcode",
        (Uf::MS, _) => "https://www.dfe.ms.gov.br/nfce/qrcode",
        (Uf::MG, _) => "https://nfce.fazenda.mg.gov.br/portalnfce/sistema/qrcode.xhtml",
        (Uf::PA, _) => "https://www.sefa.pa.gov.br/nfce/qrcode",
        (Uf::PB, _) => "https://www.sefaz.pb.gov.br/nfce/qrcode",
        (Uf::PR, _) => "https://www.fazenda.pr.gov.br/nfce/qrcode",
        (Uf::PE, _) => "https://nfce.sefaz.pe.gov.br/nfce/consulta",
        (Uf::PI, _) => "https://www.sefaz.pi.gov.br/nfce/qrcode",
        (Uf::RJ, _) => "https://www.fazenda.rj.gov.br/nfce/qrcode",
        (Uf::RN, _) => "https://www.sefaz.rn.gov.br/nfce/qrcode",
        (Uf::RS, _) => "https://www.sefaz.rs.gov.br/nfce/qrcode",
        (Uf::RO, _) => "https://www.sefaz.ro.gov.br/nfce/qrcode",
        (Uf::RR, _) => "https://www.sefaz.rr.gov.br/nfce/qrcode",
        (Uf::SC, _) => "https://sat.sef.sc.gov.br/nfce/qrcode",
        (Uf::SP, _) => "https://www.nfce.fazenda.sp.gov.br/qrcode",
        (Uf::SE, _) => "https://www.sefaz.se.gov.br/nfce/qrcode",
        (Uf::TO, _) => "https://www.sefaz.to.gov.br/nfce/qrcode",
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use secrecy::SecretString;

    use super::*;
    use crate::model::ContributorSecret;

    fn sample_input(csc: &ContributorSecret) -> QrInput<'_> {
        QrInput {
            access_key: "35260812345678000195650010000000421076543212",
            environment: Environment::Homologation,
            consumer_tax_id: None,
            issued_at: "2026-08-02T10:30:00-03:00",
            total: dec!(29.90),
            icms_total: dec!(0),
            digest_value: "q7f0V0Zz2w5o6H9YQ3mHby8FDdM=",
            csc,
            uf: Uf::SP,
        }
    }

    fn csc() -> ContributorSecret {
        ContributorSecret {
            id: "000001".to_string(),
            token: SecretString::new("CSC-TOKEN".to_string()),
        }
    }

    #[test]
    fn url_carries_all_parameters() {
        let csc = csc();
        let url = build_url(&sample_input(&csc)).unwrap();
        assert!(url.starts_with("https://www.nfce.fazenda.sp.gov.br/qrcode?"));
        for param in [
            "chNFe=35260812345678000195650010000000421076543212",
            "nVersao=3",
            "tpAmb=2",
            "dhEmi=",
            "vNF=29.90",
            "vICMS=0.00",
            "cIdToken=000001",
            "cHashQRCode=",
        ] {
            assert!(url.contains(param), "missing {param} in {url}");
        }
        // No destination: the dest parameter is omitted entirely.
        assert!(!url.contains("dest="));
        // The token itself never appears.
        assert!(!url.contains("CSC-TOKEN"));
    }

    #[test]
    fn hash_is_stable_and_token_sensitive() {
        let csc_a = csc();
        let url_a = build_url(&sample_input(&csc_a)).unwrap();
        let url_b = build_url(&sample_input(&csc_a)).unwrap();
        assert_eq!(url_a, url_b);

        let csc_c = ContributorSecret {
            id: "000001".to_string(),
            token: SecretString::new("OTHER".to_string()),
        };
        let url_c = build_url(&sample_input(&csc_c)).unwrap();
        assert_ne!(url_a, url_c);
    }

    #[test]
    fn hash_matches_reference_computation() {
        let csc = csc();
        let input = sample_input(&csc);
        let url = build_url(&input).unwrap();

        let payload = format!(
            "{}|2||{}|29.90|0.00|{}|000001",
            input.access_key, input.issued_at, input.digest_value
        );
        let mut hasher = Sha1::new();
        hasher.update(payload.as_bytes());
        hasher.update(b"CSC-TOKEN");
        let expected = hex::encode_upper(hasher.finalize());
        assert!(url.ends_with(&format!("cHashQRCode={expected}")));
    }

    #[test]
    fn png_renders_with_minimum_size() {
        let csc = csc();
        let url = build_url(&sample_input(&csc)).unwrap();
        let png = render_png(&url).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert!(decoded.width() >= 256);
        assert!(decoded.height() >= 256);
    }
}
