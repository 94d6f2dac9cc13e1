use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    parser::Parser as XmlParser,
    tree::{Document, Node},
    xpath::Context,
};
use quick_xml::{events::Event, Reader};
use rand::{rngs::OsRng, RngCore};
use time::{
    format_description::well_known::{Iso8601, Rfc3339},
    OffsetDateTime, UtcOffset,
};

use crate::{DATE_TIME_FORMAT, NS_ASSERTION, NS_METADATA, NS_PROTOCOL, NS_XMLDSIG};

pub const PII_HIDDEN: &str = "[PII is hidden]";

/// Protocol message identifier: 160 random bits, prefixed so it is a valid NCName.
pub fn random_id() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// Parses an `xs:dateTime` attribute value.
pub fn parse_instant(value: &str) -> Result<OffsetDateTime, String> {
    let value = value.trim();
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(value, &Iso8601::DEFAULT))
        .map_err(|e| format!("invalid timestamp {value:?}: {e}"))
}

/// Renders an instant as a UTC `xs:dateTime` with whole seconds.
pub fn format_instant(instant: OffsetDateTime) -> Result<String, String> {
    instant
        .to_offset(UtcOffset::UTC)
        .format(&DATE_TIME_FORMAT)
        .map_err(|e| e.to_string())
}

pub fn redact(value: &str, show_pii: bool) -> &str {
    if show_pii {
        value
    } else {
        PII_HIDDEN
    }
}

/// Upper bounds applied to attacker-supplied XML before it reaches libxml.
#[derive(Debug, Clone, Copy)]
pub struct DocumentLimits {
    pub max_size: usize,
    pub max_depth: usize,
}

/// Rejects oversized, deeply nested, or DTD-bearing documents.
pub fn guard_document(input: &[u8], limits: DocumentLimits) -> Result<(), String> {
    if input.len() > limits.max_size {
        return Err(format!(
            "document is {} bytes, limit is {}",
            input.len(),
            limits.max_size
        ));
    }

    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut roots = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(event @ (Event::Start(_) | Event::Empty(_))) => {
                if depth == 0 {
                    roots += 1;
                }
                if depth + 1 > limits.max_depth {
                    return Err(format!("nesting exceeds {} levels", limits.max_depth));
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::DocType(_)) => {
                return Err("document type declarations are not allowed".into())
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("not well-formed: {e}")),
        }
        buf.clear();
    }

    if roots != 1 {
        return Err("document must have exactly one root element".into());
    }
    Ok(())
}

pub fn parse_document(input: &[u8], limits: DocumentLimits) -> Result<Document, String> {
    guard_document(input, limits)?;
    XmlParser::default()
        .parse_string(input)
        .map_err(|e| format!("{e:?}"))
}

pub fn xpath_context(document: &Document) -> Result<Context, String> {
    let mut context =
        Context::new(document).map_err(|_| "failed to create XPath context".to_string())?;
    for (prefix, href) in [
        ("samlp", NS_PROTOCOL),
        ("saml", NS_ASSERTION),
        ("md", NS_METADATA),
        ("ds", NS_XMLDSIG),
    ] {
        context
            .register_namespace(prefix, href)
            .map_err(|_| format!("failed to register namespace {prefix}"))?;
    }
    Ok(context)
}

pub fn is_element(node: &Node, ns: &str, local_name: &str) -> bool {
    node.get_name() == local_name
        && node.get_namespace().map(|n| n.get_href()).as_deref() == Some(ns)
}

pub fn child_elements(node: &Node, ns: &str, local_name: &str) -> Vec<Node> {
    node.get_child_elements()
        .into_iter()
        .filter(|child| is_element(child, ns, local_name))
        .collect()
}

/// At most one child with the given name; more than one is an error.
pub fn optional_child(node: &Node, ns: &str, local_name: &str) -> Result<Option<Node>, String> {
    let mut nodes = child_elements(node, ns, local_name);
    match nodes.len() {
        0 => Ok(None),
        1 => Ok(nodes.pop()),
        n => Err(format!("expected at most one {local_name}, found {n}")),
    }
}

pub fn single_child(node: &Node, ns: &str, local_name: &str) -> Result<Node, String> {
    optional_child(node, ns, local_name)?.ok_or_else(|| format!("missing {local_name}"))
}

pub fn text(node: &Node) -> String {
    node.get_content().trim().to_string()
}

/// Every element below (and including) `root`, in document order.
pub fn descendants(root: &Node) -> Vec<Node> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        let mut children = node.get_child_elements();
        children.reverse();
        stack.extend(children);
        out.push(node);
    }
    out
}
