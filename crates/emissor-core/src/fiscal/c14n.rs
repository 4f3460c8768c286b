//! Canonical XML (C14N 1.0, comments omitted) over a document subtree.
//!
//! Digests are always computed over canonicalized bytes produced by parsing
//! the document and re-serializing the selected subtree: empty elements
//! expanded, attributes sorted, the inherited default namespace rendered on
//! the apex element, and C14N escaping applied. Substring search never
//! selects the subtree.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Errors while canonicalizing.
#[derive(Debug, Error)]
pub enum C14nError {
    /// The document is not well-formed XML (or not UTF-8).
    #[error("malformed document: {0}")]
    Parse(String),
    /// No element matched the requested subtree.
    #[error("subtree not found: {0}")]
    NotFound(String),
}

/// How the subtree apex is selected.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Id(&'a str),
    Name(&'a str),
}

/// Canonicalizes the subtree whose apex carries `Id="<id>"`.
///
/// # Errors
///
/// [`C14nError::Parse`] on malformed input, [`C14nError::NotFound`] when no
/// element carries the id.
pub fn canonicalize_by_id(doc: &[u8], id: &str) -> Result<Vec<u8>, C14nError> {
    canonicalize(doc, Target::Id(id))
}

/// Canonicalizes the first subtree whose apex has the given local name.
///
/// # Errors
///
/// [`C14nError::Parse`] on malformed input, [`C14nError::NotFound`] when no
/// element has the name.
pub fn canonicalize_by_name(doc: &[u8], name: &str) -> Result<Vec<u8>, C14nError> {
    canonicalize(doc, Target::Name(name))
}

/// Returns the text content of the first element with the given local name.
///
/// Used to lift `DigestValue` and friends out of a signed document.
///
/// # Errors
///
/// [`C14nError::Parse`] on malformed input.
pub fn element_text(doc: &[u8], name: &str) -> Result<Option<String>, C14nError> {
    let text = std::str::from_utf8(doc).map_err(|err| C14nError::Parse(err.to_string()))?;
    let mut reader = Reader::from_str(text);
    let mut inside = false;
    let mut content = String::new();

    loop {
        match reader
            .read_event()
            .map_err(|err| C14nError::Parse(err.to_string()))?
        {
            Event::Start(start) => {
                inside = local_name(&start) == name;
                content.clear();
            },
            Event::Text(text) if inside => {
                let value = text
                    .unescape()
                    .map_err(|err| C14nError::Parse(err.to_string()))?;
                content.push_str(&value);
            },
            Event::End(end) if inside => {
                let end_name = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
                if end_name == name {
                    return Ok(Some(content));
                }
                inside = false;
            },
            Event::Eof => return Ok(None),
            _ => {},
        }
    }
}

/// Whether an element with the given local name occurs in the document.
///
/// # Errors
///
/// [`C14nError::Parse`] on malformed input.
pub fn element_present(doc: &[u8], name: &str) -> Result<bool, C14nError> {
    let text = std::str::from_utf8(doc).map_err(|err| C14nError::Parse(err.to_string()))?;
    let mut reader = Reader::from_str(text);
    loop {
        match reader
            .read_event()
            .map_err(|err| C14nError::Parse(err.to_string()))?
        {
            Event::Start(start) | Event::Empty(start) => {
                if local_name(&start) == name {
                    return Ok(true);
                }
            },
            Event::Eof => return Ok(false),
            _ => {},
        }
    }
}

/// Returns an attribute value from the first element with the given local
/// name, parsed rather than searched for.
///
/// # Errors
///
/// [`C14nError::Parse`] on malformed input.
pub fn element_attr(doc: &[u8], name: &str, attr: &str) -> Result<Option<String>, C14nError> {
    let text = std::str::from_utf8(doc).map_err(|err| C14nError::Parse(err.to_string()))?;
    let mut reader = Reader::from_str(text);

    loop {
        match reader
            .read_event()
            .map_err(|err| C14nError::Parse(err.to_string()))?
        {
            Event::Start(start) | Event::Empty(start) => {
                if local_name(&start) != name {
                    continue;
                }
                for candidate in start.attributes() {
                    let candidate = candidate.map_err(|err| C14nError::Parse(err.to_string()))?;
                    if candidate.key.as_ref() == attr.as_bytes() {
                        let value = candidate
                            .unescape_value()
                            .map_err(|err| C14nError::Parse(err.to_string()))?;
                        return Ok(Some(value.into_owned()));
                    }
                }
                return Ok(None);
            },
            Event::Eof => return Ok(None),
            _ => {},
        }
    }
}

fn canonicalize(doc: &[u8], target: Target<'_>) -> Result<Vec<u8>, C14nError> {
    let text = std::str::from_utf8(doc).map_err(|err| C14nError::Parse(err.to_string()))?;
    let mut reader = Reader::from_str(text);

    // Effective default namespace per open element; index 0 is the document
    // scope (no namespace).
    let mut ns_stack: Vec<String> = vec![String::new()];
    let mut out = String::new();
    // Number of captured elements currently open; None until the apex.
    let mut capture_depth: Option<usize> = None;
    let mut found = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| C14nError::Parse(err.to_string()))?;
        match event {
            Event::Start(start) => {
                let parent_ns = ns_stack.last().cloned().unwrap_or_default();
                let declared = declared_default_ns(&start)?;
                let effective = declared.clone().unwrap_or_else(|| parent_ns.clone());
                ns_stack.push(effective.clone());

                if let Some(depth) = capture_depth {
                    let render_ns = declared.as_deref().filter(|ns| *ns != parent_ns);
                    render_start(&mut out, &start, render_ns)?;
                    capture_depth = Some(depth + 1);
                } else if matches(&start, target)? {
                    found = true;
                    let apex_ns = (!effective.is_empty()).then_some(effective.as_str());
                    render_start(&mut out, &start, apex_ns)?;
                    capture_depth = Some(1);
                }
            },
            Event::Empty(start) => {
                let parent_ns = ns_stack.last().cloned().unwrap_or_default();
                let declared = declared_default_ns(&start)?;

                if let Some(depth) = capture_depth {
                    let render_ns = declared.as_deref().filter(|ns| *ns != parent_ns);
                    render_start(&mut out, &start, render_ns)?;
                    render_end(&mut out, &start);
                    capture_depth = Some(depth);
                } else if matches(&start, target)? {
                    found = true;
                    let effective = declared.unwrap_or(parent_ns);
                    let apex_ns = (!effective.is_empty()).then_some(effective.as_str());
                    render_start(&mut out, &start, apex_ns)?;
                    render_end(&mut out, &start);
                    break;
                }
            },
            Event::End(end) => {
                ns_stack.pop();
                if let Some(depth) = capture_depth {
                    out.push_str("</");
                    out.push_str(&String::from_utf8_lossy(end.name().as_ref()));
                    out.push('>');
                    if depth == 1 {
                        break;
                    }
                    capture_depth = Some(depth - 1);
                }
            },
            Event::Text(text) => {
                if capture_depth.is_some() {
                    let value = text
                        .unescape()
                        .map_err(|err| C14nError::Parse(err.to_string()))?;
                    escape_text(&value, &mut out);
                }
            },
            Event::CData(data) => {
                if capture_depth.is_some() {
                    // C14N replaces CDATA sections with escaped text.
                    let value = String::from_utf8_lossy(data.as_ref()).into_owned();
                    escape_text(&value, &mut out);
                }
            },
            Event::Eof => break,
            // Comments are omitted; declarations, PIs and doctypes never
            // occur inside the signed subtree.
            _ => {},
        }
    }

    if !found {
        let what = match target {
            Target::Id(id) => format!("Id={id}"),
            Target::Name(name) => format!("element {name}"),
        };
        return Err(C14nError::NotFound(what));
    }
    Ok(out.into_bytes())
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn matches(start: &BytesStart<'_>, target: Target<'_>) -> Result<bool, C14nError> {
    match target {
        Target::Name(name) => Ok(local_name(start) == name),
        Target::Id(id) => {
            for attr in start.attributes() {
                let attr = attr.map_err(|err| C14nError::Parse(err.to_string()))?;
                if attr.key.as_ref() == b"Id" {
                    let value = attr
                        .unescape_value()
                        .map_err(|err| C14nError::Parse(err.to_string()))?;
                    return Ok(value == id);
                }
            }
            Ok(false)
        },
    }
}

fn declared_default_ns(start: &BytesStart<'_>) -> Result<Option<String>, C14nError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|err| C14nError::Parse(err.to_string()))?;
        if attr.key.as_ref() == b"xmlns" {
            let value = attr
                .unescape_value()
                .map_err(|err| C14nError::Parse(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn render_start(
    out: &mut String,
    start: &BytesStart<'_>,
    xmlns: Option<&str>,
) -> Result<(), C14nError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    out.push('<');
    out.push_str(&name);

    // Namespace declarations precede attributes in canonical form.
    if let Some(ns) = xmlns {
        out.push_str(" xmlns=\"");
        escape_attr(ns, out);
        out.push('"');
    }

    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| C14nError::Parse(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value: Cow<'_, str> = attr
            .unescape_value()
            .map_err(|err| C14nError::Parse(err.to_string()))?;
        attrs.push((key, value.into_owned()));
    }
    attrs.sort();

    for (key, value) in &attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');
    Ok(())
}

fn render_end(out: &mut String, start: &BytesStart<'_>) {
    out.push_str("</");
    out.push_str(&String::from_utf8_lossy(start.name().as_ref()));
    out.push('>');
}

fn escape_text(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = concat!(
        "<root xmlns=\"urn:example\">",
        "<inner Id=\"target\" versao=\"4.00\"><a>1 &amp; 2</a><b/></inner>",
        "<other/>",
        "</root>"
    );

    #[test]
    fn apex_inherits_default_namespace() {
        let canonical = canonicalize_by_id(DOC.as_bytes(), "target").unwrap();
        assert_eq!(
            String::from_utf8(canonical).unwrap(),
            "<inner xmlns=\"urn:example\" Id=\"target\" versao=\"4.00\">\
             <a>1 &amp; 2</a><b></b></inner>"
        );
    }

    #[test]
    fn empty_elements_are_expanded() {
        let canonical = canonicalize_by_name(DOC.as_bytes(), "other").unwrap();
        assert_eq!(
            String::from_utf8(canonical).unwrap(),
            "<other xmlns=\"urn:example\"></other>"
        );
    }

    #[test]
    fn attributes_are_sorted() {
        let doc = "<r><e z=\"1\" a=\"2\" Id=\"x\">t</e></r>";
        let canonical = canonicalize_by_id(doc.as_bytes(), "x").unwrap();
        assert_eq!(
            String::from_utf8(canonical).unwrap(),
            "<e Id=\"x\" a=\"2\" z=\"1\">t</e>"
        );
    }

    #[test]
    fn nested_redeclaration_is_rendered() {
        let doc = "<r xmlns=\"urn:a\"><e Id=\"x\"><s xmlns=\"urn:b\">t</s></e></r>";
        let canonical = canonicalize_by_id(doc.as_bytes(), "x").unwrap();
        assert_eq!(
            String::from_utf8(canonical).unwrap(),
            "<e xmlns=\"urn:a\" Id=\"x\"><s xmlns=\"urn:b\">t</s></e>"
        );
    }

    #[test]
    fn comments_are_omitted() {
        let doc = "<r><e Id=\"x\"><!-- hidden -->v</e></r>";
        let canonical = canonicalize_by_id(doc.as_bytes(), "x").unwrap();
        assert_eq!(String::from_utf8(canonical).unwrap(), "<e Id=\"x\">v</e>");
    }

    #[test]
    fn missing_target_reports_not_found() {
        assert!(matches!(
            canonicalize_by_id(DOC.as_bytes(), "nope"),
            Err(C14nError::NotFound(_))
        ));
    }

    #[test]
    fn element_text_finds_first_occurrence() {
        let doc = "<r><v>alpha</v><v>beta</v></r>";
        assert_eq!(
            element_text(doc.as_bytes(), "v").unwrap().as_deref(),
            Some("alpha")
        );
        assert_eq!(element_text(doc.as_bytes(), "w").unwrap(), None);
    }
}
