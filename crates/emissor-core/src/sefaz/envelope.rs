//! SOAP 1.2 envelope construction and response parsing.
//!
//! Requests wrap a single synchronous batch (`idLote = 1`, `indSinc = 1`).
//! Responses are read with a streaming parser; the reply semantics are the
//! `cStat` / `xMotivo` / `nProt` triple, with the per-document protocol
//! block taking precedence over the lot header.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::AuthorityReply;
use crate::fiscal::{NFE_NAMESPACE, SCHEMA_VERSION};
use crate::model::Uf;

/// WSDL namespace of the v4 authorization service.
const AUTHORIZATION_WSDL: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeAutorizacao4";
/// WSDL namespace of the v4 status service.
const STATUS_WSDL: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeStatusServico4";
/// SOAP 1.2 envelope namespace.
const SOAP_ENVELOPE: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Builds the authorization envelope around a signed document.
#[must_use]
pub fn authorization_envelope(uf: Uf, signed_document: &[u8]) -> String {
    let document = String::from_utf8_lossy(signed_document);
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<soap12:Envelope xmlns:soap12=\"{soap}\">",
            "<soap12:Header>",
            "<nfeCabecMsg xmlns=\"{wsdl}\">",
            "<cUF>{cuf}</cUF>",
            "<versaoDados>{version}</versaoDados>",
            "</nfeCabecMsg>",
            "</soap12:Header>",
            "<soap12:Body>",
            "<nfeDadosMsg xmlns=\"{wsdl}\">",
            "<NFeAutorizacaoLote xmlns=\"{nfe}\">",
            "<idLote>1</idLote>",
            "<indSinc>1</indSinc>",
            "{document}",
            "</NFeAutorizacaoLote>",
            "</nfeDadosMsg>",
            "</soap12:Body>",
            "</soap12:Envelope>"
        ),
        soap = SOAP_ENVELOPE,
        wsdl = AUTHORIZATION_WSDL,
        cuf = uf.ibge_code(),
        version = SCHEMA_VERSION,
        nfe = NFE_NAMESPACE,
        document = document,
    )
}

/// Builds the status-service envelope (`consStatServ`).
#[must_use]
pub fn status_envelope(uf: Uf, tp_amb: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<soap12:Envelope xmlns:soap12=\"{soap}\">",
            "<soap12:Header>",
            "<nfeCabecMsg xmlns=\"{wsdl}\">",
            "<cUF>{cuf}</cUF>",
            "<versaoDados>{version}</versaoDados>",
            "</nfeCabecMsg>",
            "</soap12:Header>",
            "<soap12:Body>",
            "<nfeDadosMsg xmlns=\"{wsdl}\">",
            "<consStatServ xmlns=\"{nfe}\" versao=\"{version}\">",
            "<tpAmb>{tp_amb}</tpAmb>",
            "<cUF>{cuf}</cUF>",
            "<xServ>STATUS</xServ>",
            "</consStatServ>",
            "</nfeDadosMsg>",
            "</soap12:Body>",
            "</soap12:Envelope>"
        ),
        soap = SOAP_ENVELOPE,
        wsdl = STATUS_WSDL,
        cuf = uf.ibge_code(),
        version = SCHEMA_VERSION,
        nfe = NFE_NAMESPACE,
        tp_amb = tp_amb,
    )
}

/// Parses an authority response body into an [`AuthorityReply`].
///
/// Returns `None` when no `cStat` can be found; callers treat that as a
/// malformed response.
#[must_use]
pub fn parse_authority_reply(body: &[u8]) -> Option<AuthorityReply> {
    let text = String::from_utf8_lossy(body);
    let mut reader = Reader::from_str(&text);

    let mut cstat: Option<u16> = None;
    let mut reason = String::new();
    let mut protocol: Option<String> = None;
    let mut current: Option<&'static str> = None;
    let mut in_prot_block = false;
    // The synchronous response carries the lot header first and the
    // per-document protocol later; the protocol block wins.
    let mut prot_cstat_seen = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = start.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"infProt" => in_prot_block = true,
                    b"cStat" => current = Some("cStat"),
                    b"xMotivo" => current = Some("xMotivo"),
                    b"nProt" => current = Some("nProt"),
                    _ => current = None,
                }
            },
            Ok(Event::Text(value)) => {
                let Some(field) = current else { continue };
                let value = match value.unescape() {
                    Ok(value) => value.into_owned(),
                    Err(_) => return None,
                };
                match field {
                    "cStat" => {
                        let parsed = value.trim().parse::<u16>().ok()?;
                        if in_prot_block {
                            cstat = Some(parsed);
                            prot_cstat_seen = true;
                        } else if !prot_cstat_seen {
                            cstat = Some(parsed);
                        }
                    },
                    "xMotivo" => {
                        if in_prot_block || !prot_cstat_seen {
                            reason = value.trim().to_string();
                        }
                    },
                    "nProt" => {
                        let trimmed = value.trim();
                        if !trimmed.is_empty() {
                            protocol = Some(trimmed.to_string());
                        }
                    },
                    _ => {},
                }
            },
            Ok(Event::End(end)) => {
                if end.local_name().as_ref() == b"infProt" {
                    in_prot_block = false;
                }
                current = None;
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {},
        }
    }

    cstat.map(|cstat| AuthorityReply {
        cstat,
        reason,
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHORIZED_RESPONSE: &str = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
        "<soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope\">",
        "<soap:Body><nfeResultMsg>",
        "<retEnviNFe xmlns=\"http://www.portalfiscal.inf.br/nfe\" versao=\"4.00\">",
        "<tpAmb>2</tpAmb><verAplic>SP_NFCE_PL_009</verAplic>",
        "<cStat>104</cStat><xMotivo>Lote processado</xMotivo><cUF>35</cUF>",
        "<protNFe versao=\"4.00\"><infProt>",
        "<tpAmb>2</tpAmb><chNFe>35260812345678000195650010000000421076543212</chNFe>",
        "<dhRecbto>2026-08-02T10:30:05-03:00</dhRecbto>",
        "<nProt>135260000000042</nProt><digVal>abc=</digVal>",
        "<cStat>100</cStat><xMotivo>Autorizado o uso da NF-e</xMotivo>",
        "</infProt></protNFe></retEnviNFe>",
        "</nfeResultMsg></soap:Body></soap:Envelope>"
    );

    #[test]
    fn protocol_block_takes_precedence() {
        let reply = parse_authority_reply(AUTHORIZED_RESPONSE.as_bytes()).unwrap();
        assert_eq!(reply.cstat, 100);
        assert_eq!(reply.reason, "Autorizado o uso da NF-e");
        assert_eq!(reply.protocol.as_deref(), Some("135260000000042"));
    }

    #[test]
    fn lot_header_is_used_when_no_protocol_block() {
        let body = concat!(
            "<retEnviNFe><cStat>108</cStat>",
            "<xMotivo>Servico Paralisado Momentaneamente</xMotivo></retEnviNFe>"
        );
        let reply = parse_authority_reply(body.as_bytes()).unwrap();
        assert_eq!(reply.cstat, 108);
        assert_eq!(reply.reason, "Servico Paralisado Momentaneamente");
        assert_eq!(reply.protocol, None);
    }

    #[test]
    fn missing_cstat_is_malformed() {
        assert!(parse_authority_reply(b"<html>gateway error</html>").is_none());
        assert!(parse_authority_reply(b"<retEnviNFe><cStat>abc</cStat></retEnviNFe>").is_none());
    }

    #[test]
    fn authorization_envelope_embeds_document_and_header() {
        let envelope = authorization_envelope(Uf::SP, b"<NFe><infNFe/></NFe>");
        assert!(envelope.contains("<cUF>35</cUF>"));
        assert!(envelope.contains("<versaoDados>4.00</versaoDados>"));
        assert!(envelope.contains("<idLote>1</idLote>"));
        assert!(envelope.contains("<indSinc>1</indSinc>"));
        assert!(envelope.contains("<NFe><infNFe/></NFe>"));
        assert!(envelope.contains("soap12:Envelope"));
    }

    #[test]
    fn status_envelope_carries_service_request() {
        let envelope = status_envelope(Uf::RS, "2");
        assert!(envelope.contains("<cUF>43</cUF>"));
        assert!(envelope.contains("<xServ>STATUS</xServ>"));
        assert!(envelope.contains("NFeStatusServico4"));
    }
}
