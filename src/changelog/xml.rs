//! XML changelog reader
//!
//! Turns a changelog XML document into a [`ParsedNode`] tree using
//! `quick-xml`. Namespace prefixes are dropped (`dbchangelog:changeSet`
//! becomes `changeSet`), text and CDATA sections of one element are joined
//! with newlines, and each node records the line and column where its tag
//! ends.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::changelog::ParseError;
use crate::changelog::node::{ParsedNode, SourcePosition};

/// Parse an XML changelog document into a node tree.
pub fn parse_xml(xml: &str, path: &str) -> Result<ParsedNode, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<ParsedNode> = Vec::new();
    let mut root: Option<ParsedNode> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Syntax {
                path: path.to_string(),
                message: format!(
                    "XML parse error at {}: {}",
                    offset_to_position(xml, reader.buffer_position()),
                    e
                ),
            })?;
        let position = offset_to_position(xml, reader.buffer_position());

        match event {
            Event::Eof => break,
            Event::Start(ref e) => {
                let node = start_node(e, position, path)?;
                stack.push(node);
            }
            Event::Empty(ref e) => {
                let node = start_node(e, position, path)?;
                attach(&mut stack, &mut root, node, path)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| ParseError::Syntax {
                    path: path.to_string(),
                    message: format!("unexpected closing tag at {}", position),
                })?;
                attach(&mut stack, &mut root, node, path)?;
            }
            Event::Text(ref e) => {
                let text = e.unescape().map_err(|err| ParseError::Syntax {
                    path: path.to_string(),
                    message: format!("XML text unescape error at {}: {}", position, err),
                })?;
                append_text(&mut stack, &text);
            }
            Event::CData(ref e) => {
                let text = String::from_utf8_lossy(e.as_ref());
                append_text(&mut stack, &text);
            }
            // Ignore comments, processing instructions, doctype.
            _ => {}
        }

        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Syntax {
            path: path.to_string(),
            message: format!("unclosed element {}", open.location()),
        });
    }

    root.ok_or_else(|| ParseError::Syntax {
        path: path.to_string(),
        message: "document has no root element".to_string(),
    })
}

fn start_node(
    e: &BytesStart<'_>,
    position: SourcePosition,
    path: &str,
) -> Result<ParsedNode, ParseError> {
    let mut node = ParsedNode::new(local_name_str(e.name().as_ref()));
    node.position = Some(position);
    node.attributes = collect_attributes(e, path)?;
    Ok(node)
}

/// Attach a completed node to its parent, or make it the root.
fn attach(
    stack: &mut [ParsedNode],
    root: &mut Option<ParsedNode>,
    node: ParsedNode,
    path: &str,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(ParseError::Syntax {
            path: path.to_string(),
            message: format!("second root element {}", node.location()),
        }),
    }
}

fn append_text(stack: &mut [ParsedNode], text: &str) {
    if let Some(current) = stack.last_mut() {
        match current.text {
            Some(ref mut existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => current.text = Some(text.to_string()),
        }
    }
}

/// Collect attributes in declaration order, dropping `xmlns` declarations
/// and namespace prefixes such as `xsi:`.
fn collect_attributes(
    e: &BytesStart<'_>,
    path: &str,
) -> Result<Vec<(String, String)>, ParseError> {
    let mut attrs = Vec::new();
    for attr_result in e.attributes() {
        let attr = attr_result.map_err(|err| ParseError::Syntax {
            path: path.to_string(),
            message: format!("failed to parse XML attribute: {}", err),
        })?;
        let raw_key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        if raw_key == "xmlns" || raw_key.starts_with("xmlns:") || raw_key.contains(':') {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|err| ParseError::Syntax {
                path: path.to_string(),
                message: format!("failed to unescape attribute '{}': {}", raw_key, err),
            })?
            .to_string();
        attrs.push((raw_key, value));
    }
    Ok(attrs)
}

/// Get the local name from a potentially namespace-prefixed tag name.
fn local_name_str(name: &[u8]) -> String {
    let full = String::from_utf8_lossy(name);
    match full.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => full.to_string(),
    }
}

/// Convert a byte offset in the XML string to a 1-based line and column.
fn offset_to_position(xml: &str, offset: usize) -> SourcePosition {
    let mut clamped = offset.min(xml.len());
    while !xml.is_char_boundary(clamped) {
        clamped -= 1;
    }
    let before = &xml[..clamped];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(nl) => clamped - nl,
        None => clamped + 1,
    };
    SourcePosition { line, column }
}
