//! DANFE NFC-e rendering: the printable receipt handed to the consumer.
//!
//! Receipt format, 80mm wide, height sized to the item count. The layout is
//! intentionally plain; the fiscally relevant content is the access key,
//! the authorization protocol, and the QR URL.

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::{Company, ContingencyKind, Environment, Item, Payment};

/// Errors producing the PDF.
#[derive(Debug, Error)]
pub enum DanfeError {
    /// The PDF backend refused the document.
    #[error("pdf rendering failed: {0}")]
    Render(String),
}

/// Everything the renderer needs for one receipt.
pub struct DanfeInput<'a> {
    /// Issuing company (name, tax id, address).
    pub company: &'a Company,
    /// Sale items.
    pub items: &'a [Item],
    /// Payments.
    pub payments: &'a [Payment],
    /// Document total.
    pub total: Decimal,
    /// The 44-digit access key.
    pub access_key: &'a str,
    /// Authority protocol number.
    pub protocol: &'a str,
    /// Authorization timestamp, already formatted.
    pub authorized_at: &'a str,
    /// Document number.
    pub number: i64,
    /// Document series.
    pub series: u16,
    /// Emission environment.
    pub environment: Environment,
    /// QR consultation URL.
    pub qr_url: &'a str,
    /// Contingency marker retained in the artifact.
    pub contingency: Option<ContingencyKind>,
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    mono: IndirectFontRef,
}

/// Renders the receipt.
///
/// # Errors
///
/// [`DanfeError::Render`] when the backend fails; the layout itself is
/// total over its inputs.
pub fn render(input: &DanfeInput<'_>) -> Result<Vec<u8>, DanfeError> {
    let line_height: f32 = 3.6;
    let body_lines = input.items.len() as f32 + input.payments.len() as f32;
    let height: f32 = 95.0 + body_lines * line_height;

    let (doc, page, layer) = PdfDocument::new("DANFE NFC-e", Mm(80.0), Mm(height), "danfe");
    let fonts = Fonts {
        regular: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|err| DanfeError::Render(err.to_string()))?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|err| DanfeError::Render(err.to_string()))?,
        mono: doc
            .add_builtin_font(BuiltinFont::Courier)
            .map_err(|err| DanfeError::Render(err.to_string()))?,
    };
    let layer = doc.get_page(page).get_layer(layer);

    let mut y: f32 = height - 6.0;
    let left: f32 = 4.0;

    write(&layer, &fonts.bold, 8.0, left, &mut y, &input.company.legal_name);
    write(
        &layer,
        &fonts.regular,
        6.5,
        left,
        &mut y,
        &format!("CNPJ {}  IE {}", input.company.cnpj, input.company.ie),
    );
    let address = &input.company.address;
    write(
        &layer,
        &fonts.regular,
        6.5,
        left,
        &mut y,
        &format!(
            "{}, {} - {} - {}/{}",
            address.street,
            address.number,
            address.district,
            address.municipality,
            address.uf.as_str()
        ),
    );
    y -= 2.0;

    write(
        &layer,
        &fonts.bold,
        7.0,
        left,
        &mut y,
        "DANFE NFC-e - Documento Auxiliar da Nota Fiscal",
    );
    write(
        &layer,
        &fonts.bold,
        7.0,
        left,
        &mut y,
        "de Consumidor Eletronica",
    );
    write(
        &layer,
        &fonts.regular,
        6.5,
        left,
        &mut y,
        &format!(
            "Numero {}  Serie {}  {}",
            input.number,
            input.series,
            match input.environment {
                Environment::Production => "",
                Environment::Homologation => "AMBIENTE DE HOMOLOGACAO - SEM VALOR FISCAL",
            }
        ),
    );
    y -= 2.0;

    // Item table.
    write(
        &layer,
        &fonts.bold,
        6.0,
        left,
        &mut y,
        "COD  DESCRICAO  QTD UN  VL.UNIT  VL.TOTAL",
    );
    for item in input.items {
        let code = item.gtin.as_deref().unwrap_or(&item.ncm);
        write(
            &layer,
            &fonts.regular,
            6.0,
            left,
            &mut y,
            &format!(
                "{} {} {:.4} {} {:.2} {:.2}",
                code,
                truncate(&item.description, 24),
                item.quantity,
                item.unit,
                item.unit_price.round_dp(2),
                item.total()
            ),
        );
    }
    y -= 1.0;
    write(
        &layer,
        &fonts.bold,
        7.0,
        left,
        &mut y,
        &format!("TOTAL R$ {:.2}", input.total),
    );
    y -= 1.0;

    for payment in input.payments {
        write(
            &layer,
            &fonts.regular,
            6.5,
            left,
            &mut y,
            &format!("FORMA {}  R$ {:.2}", payment.method, payment.amount),
        );
    }
    y -= 2.0;

    write(&layer, &fonts.bold, 6.5, left, &mut y, "CHAVE DE ACESSO");
    write(&layer, &fonts.mono, 6.0, left, &mut y, input.access_key);
    write(
        &layer,
        &fonts.regular,
        6.0,
        left,
        &mut y,
        &format!("Protocolo {}  {}", input.protocol, input.authorized_at),
    );
    write(
        &layer,
        &fonts.regular,
        5.0,
        left,
        &mut y,
        &format!("Consulta via leitor de QR Code: {}", truncate(input.qr_url, 70)),
    );

    let contingency_line = match input.contingency {
        Some(kind) => format!("Emitida em contingencia ({})", kind.as_str()),
        None => "Emitida em contingencia: Nao".to_string(),
    };
    write(&layer, &fonts.regular, 5.5, left, &mut y, &contingency_line);

    doc.save_to_bytes()
        .map_err(|err| DanfeError::Render(err.to_string()))
}

fn write(
    layer: &PdfLayerReference,
    font: &IndirectFontRef,
    size: f32,
    x: f32,
    y: &mut f32,
    text: &str,
) {
    layer.use_text(text, size, Mm(x), Mm(*y), font);
    *y -= 3.6;
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::model::{sample_company, sample_payload};

    #[test]
    fn renders_a_parsable_pdf() {
        let payload = sample_payload();
        let company = sample_company();
        let input = DanfeInput {
            company: &company,
            items: &payload.items,
            payments: &payload.payments,
            total: dec!(29.90),
            access_key: "35260812345678000195650010000000421076543212",
            protocol: "135260000000042",
            authorized_at: "2026-08-02T10:30:05-03:00",
            number: 42,
            series: 1,
            environment: Environment::Homologation,
            qr_url: "https://www.nfce.fazenda.sp.gov.br/qrcode?chNFe=x",
            contingency: None,
        };

        let pdf = render(&input).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        assert!(pdf.len() > 500);
    }

    #[test]
    fn contingency_marker_is_retained() {
        let payload = sample_payload();
        let company = sample_company();
        let input = DanfeInput {
            company: &company,
            items: &payload.items,
            payments: &payload.payments,
            total: dec!(29.90),
            access_key: "35260812345678000195650010000000421076543212",
            protocol: "135260000000042",
            authorized_at: "2026-08-02T10:30:05-03:00",
            number: 42,
            series: 1,
            environment: Environment::Homologation,
            qr_url: "https://example/qr",
            contingency: Some(ContingencyKind::SvcAn),
        };

        // The PDF content stream is compressed; rendering successfully with
        // the marker present is what this guards.
        render(&input).unwrap();
    }
}
