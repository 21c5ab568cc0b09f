//! HTML repair: parse arbitrary real-world HTML and re-serialize it as
//! well-formed XML so the XPath engine can work on it.

use html5ever::tendril::TendrilSink;
use html5ever::{ParseOpts, parse_document};
use markup5ever_rcdom::{Handle, NodeData, RcDom};

use crate::query::xpath::escape_xml;

/// Elements that never carry content and serialize self-closed.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "source", "track", "wbr",
];

/// Parse HTML (leniently, with the browser-grade parser) and emit the
/// document as well-formed XML. The result always has a single root element;
/// an empty input yields an empty `<html>` document shell.
pub fn repair_html(html: &str) -> String {
    // reading from an in-memory slice cannot fail; fall back to an empty
    // document if it somehow does
    let dom = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut html.as_bytes())
        .unwrap_or_default();

    let mut out = String::with_capacity(html.len());

    // serialize the first element child of the document (the <html> root the
    // parser always synthesizes)
    for child in dom.document.children.borrow().iter() {
        if matches!(child.data, NodeData::Element { .. }) {
            serialize_node(child, &mut out);

            break;
        }
    }

    if out.is_empty() {
        out.push_str("<html/>");
    }

    out
}

fn serialize_node(node: &Handle, out: &mut String) {
    match &node.data {
        NodeData::Element { name, attrs, .. } => {
            let tag = name.local.as_ref();

            out.push('<');
            out.push_str(tag);

            for attr in attrs.borrow().iter() {
                let attr_name = attr.name.local.as_ref();

                if !is_xml_name(attr_name) {
                    continue;
                }

                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                out.push_str(&escape_xml(&attr.value));
                out.push('"');
            }

            let children = node.children.borrow();

            if children.is_empty() && VOID_ELEMENTS.contains(&tag) {
                out.push_str("/>");
            } else {
                out.push('>');

                for child in children.iter() {
                    serialize_node(child, out);
                }

                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
        NodeData::Text { contents } => {
            out.push_str(&escape_xml(&contents.borrow()));
        }
        NodeData::Comment { .. }
        | NodeData::Doctype { .. }
        | NodeData::ProcessingInstruction { .. }
        | NodeData::Document => {}
    }
}

/// Attribute names that survive the XML round trip. The HTML parser accepts
/// nearly anything; the XML parser does not.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}
