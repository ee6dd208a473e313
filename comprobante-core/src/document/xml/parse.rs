//! Streaming parse into the syntactic tree.
use std::borrow::Cow;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{Attribute, Document, Element, NamespaceDecl, Node, XmlError};

/// Parses a UTF-8 XML document.
///
/// Line endings are normalized to `\n` and literal whitespace in attribute values to spaces,
/// as an XML processor would. CDATA sections become plain text; comments, processing
/// instructions and the DOCTYPE are dropped.
pub fn parse_document(xml: &str) -> Result<Document, XmlError> {
    let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| XmlError::Parse {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(XmlError::TrailingContent);
                }
                stack.push(open_element(&start, &reader)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(XmlError::TrailingContent);
                }
                let el = open_element(&start, &reader)?;
                close_element(el, &mut stack, &mut root);
            }
            Event::End(_) => match stack.pop() {
                Some(el) => close_element(el, &mut stack, &mut root),
                None => {
                    return Err(XmlError::Parse {
                        position: reader.buffer_position() as u64,
                        message: "unmatched end tag".to_owned(),
                    })
                }
            },
            Event::Text(text) => {
                let raw = std::str::from_utf8(&text)?;
                let normalized = normalize_line_endings(raw);
                let value = unescape(&normalized).map_err(|e| XmlError::Parse {
                    position: reader.buffer_position() as u64,
                    message: e.to_string(),
                })?;
                push_text(value.into_owned(), &mut stack, root.is_some())?;
            }
            Event::CData(data) => {
                let raw = data.into_inner();
                let raw = std::str::from_utf8(&raw)?;
                push_text(normalize_line_endings(raw).into_owned(), &mut stack, root.is_some())?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse {
            position: reader.buffer_position() as u64,
            message: "unexpected end of document".to_owned(),
        });
    }
    root.map(Document::new).ok_or(XmlError::MissingRoot)
}

pub fn parse_document_bytes(xml: &[u8]) -> Result<Document, XmlError> {
    parse_document(std::str::from_utf8(xml)?)
}

fn open_element(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Element, XmlError> {
    let qname = std::str::from_utf8(start.name().as_ref())?.to_owned();
    let (prefix, name) = split_qname(&qname);

    let mut namespaces = Vec::new();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
        let key = std::str::from_utf8(attr.key.as_ref())?;
        let raw = std::str::from_utf8(&attr.value)?;
        let normalized: String = normalize_line_endings(raw)
            .chars()
            .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
            .collect();
        let value = unescape(&normalized)
            .map_err(|e| XmlError::Parse {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            })?
            .into_owned();

        match split_qname(key) {
            (None, "xmlns") => namespaces.push(NamespaceDecl { prefix: None, uri: value }),
            (Some("xmlns"), declared) => namespaces.push(NamespaceDecl {
                prefix: Some(declared.to_owned()),
                uri: value,
            }),
            (prefix, local) => attributes.push(Attribute {
                prefix: prefix.map(str::to_owned),
                name: local.to_owned(),
                value,
            }),
        }
    }

    Ok(Element::from_parts(
        prefix.map(str::to_owned),
        name.to_owned(),
        namespaces,
        attributes,
        Vec::new(),
    ))
}

fn close_element(el: Element, stack: &mut [Element], root: &mut Option<Element>) {
    match stack.last_mut() {
        Some(parent) => parent.children_mut().push(Node::Element(el)),
        None => *root = Some(el),
    }
}

fn push_text(text: String, stack: &mut [Element], after_root: bool) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            if text.is_empty() {
                return Ok(());
            }
            // Adjacent text and CDATA collapse into one node.
            if let Some(Node::Text(prev)) = parent.children_mut().last_mut() {
                prev.push_str(&text);
            } else {
                parent.children_mut().push(Node::Text(text));
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None if after_root => Err(XmlError::TrailingContent),
        None => Err(XmlError::MissingRoot),
    }
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn normalize_line_endings(raw: &str) -> Cow<'_, str> {
    if raw.contains('\r') {
        Cow::Owned(raw.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixes_declarations_and_attributes() {
        let doc = parse_document(
            r#"<?xml version="1.0" encoding="utf-8"?>
<!-- emitido -->
<fe:FacturaElectronica xmlns:fe="urn:fe" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="urn:fe x.xsd">
  <fe:Clave>50601012500123456789000100001010000000001112345678</fe:Clave>
  <fe:Nota><![CDATA[a < b]]> &amp; c</fe:Nota>
  <fe:Vacio/>
</fe:FacturaElectronica>"#,
        )
        .unwrap();

        let root = doc.root();
        assert_eq!(root.prefix(), Some("fe"));
        assert_eq!(root.name(), "FacturaElectronica");
        assert_eq!(root.namespaces().len(), 2);
        assert_eq!(root.attributes().len(), 1);
        assert_eq!(root.attributes()[0].qualified_name(), "xsi:schemaLocation");
        assert_eq!(root.child("Nota").unwrap().text(), "a < b & c");
        assert!(root.child("Vacio").unwrap().children().is_empty());
        assert_eq!(root.child_elements().count(), 3);
    }

    #[test]
    fn normalizes_line_endings_and_attribute_whitespace() {
        let doc = parse_document("<a b=\"x\ty\r\nz\">1\r\n2\r3</a>").unwrap();
        assert_eq!(doc.root().attribute("b"), Some("x y z"));
        assert_eq!(doc.root().text(), "1\n2\n3");
    }

    #[test]
    fn character_references_survive_normalization() {
        let doc = parse_document("<a b=\"x&#xA;y\">&#xD;</a>").unwrap();
        assert_eq!(doc.root().attribute("b"), Some("x\ny"));
        assert_eq!(doc.root().text(), "\r");
    }

    #[test]
    fn rejects_missing_root_and_trailing_elements() {
        assert!(matches!(parse_document("   "), Err(XmlError::MissingRoot)));
        assert!(matches!(
            parse_document("<a></a><b></b>"),
            Err(XmlError::TrailingContent)
        ));
        assert!(matches!(parse_document("<a><b></a>"), Err(XmlError::Parse { .. })));
    }

    #[test]
    fn strips_byte_order_mark() {
        let doc = parse_document_bytes("\u{feff}<a/>".as_bytes()).unwrap();
        assert_eq!(doc.root().name(), "a");
    }
}
