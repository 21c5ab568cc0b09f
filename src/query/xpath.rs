//! XPath 1.0 queries over parsed XML/XHTML trees.
//!
//! Node results are rendered in one of two ways: with the *text-only* flag
//! set, element results are flattened by walking their text descendants and
//! joining the trimmed pieces with single spaces; without it, element results
//! are re-serialized as markup. Attribute and string-typed results bypass the
//! flattener either way.

use sxd_document::Package;
use sxd_document::dom::{ChildOfElement, Element};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value, XPath};

use super::QueryError;

pub struct XPathQuery {
    expression: String,
    xpath: XPath,
    text_only: bool,
}

impl std::fmt::Debug for XPathQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XPathQuery")
            .field("expression", &self.expression)
            .field("text_only", &self.text_only)
            .finish()
    }
}

impl XPathQuery {
    pub fn compile(expression: &str, text_only: bool) -> Result<Self, QueryError> {
        let xpath = Factory::new()
            .build(expression)
            .map_err(|e| QueryError::Compile(e.to_string()))?
            .ok_or_else(|| QueryError::Compile("empty XPath expression".to_owned()))?;

        Ok(Self {
            expression: expression.to_owned(),
            xpath,
            text_only,
        })
    }

    fn evaluate<'d>(&self, package: &'d Package) -> Result<Value<'d>, QueryError> {
        let document = package.as_document();

        self.xpath
            .evaluate(&Context::new(), document.root())
            .map_err(|e| QueryError::Eval(e.to_string()))
    }

    /// Boolean conversion per XPath rules: non-empty node set, true boolean,
    /// non-zero number, or non-empty string.
    pub fn get_bool(&self, package: &Package) -> Result<bool, QueryError> {
        Ok(match self.evaluate(package)? {
            Value::Nodeset(nodes) => nodes.size() > 0,
            Value::Boolean(b) => b,
            Value::Number(n) => n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        })
    }

    /// First match in document order, or the empty string.
    pub fn get_first(&self, package: &Package) -> Result<String, QueryError> {
        Ok(match self.evaluate(package)? {
            Value::Nodeset(nodes) => nodes
                .document_order()
                .first()
                .map(|node| self.node_to_string(*node))
                .unwrap_or_default(),
            other => value_to_string(&other),
        })
    }

    /// All matches in document order; empty node renderings are skipped.
    pub fn get_all(&self, package: &Package) -> Result<Vec<String>, QueryError> {
        Ok(match self.evaluate(package)? {
            Value::Nodeset(nodes) => nodes
                .document_order()
                .into_iter()
                .map(|node| self.node_to_string(node))
                .filter(|result| !result.is_empty())
                .collect(),
            other => {
                let result = value_to_string(&other);

                if result.is_empty() { Vec::new() } else { vec![result] }
            }
        })
    }

    fn node_to_string(&self, node: Node<'_>) -> String {
        match node {
            Node::Attribute(attribute) => attribute.value().to_owned(),
            Node::Text(text) => text.text().to_owned(),
            Node::Element(element) => {
                if self.text_only {
                    let mut pieces = Vec::new();

                    collect_text(element, &mut pieces);

                    pieces.join(" ")
                } else {
                    let mut out = String::new();

                    for child in element.children() {
                        serialize_child(child, &mut out);
                    }

                    out
                }
            }
            Node::Root(root) => root
                .children()
                .into_iter()
                .filter_map(|child| match child {
                    sxd_document::dom::ChildOfRoot::Element(element) => Some(element),
                    _ => None,
                })
                .map(|element| self.node_to_string(Node::Element(element)))
                .collect(),
            _ => String::new(),
        }
    }
}

fn value_to_string(value: &Value<'_>) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        Value::Nodeset(_) => String::new(),
    }
}

/// Collect trimmed text descendants of an element in document order.
fn collect_text(element: Element<'_>, pieces: &mut Vec<String>) {
    for child in element.children() {
        match child {
            ChildOfElement::Text(text) => {
                let trimmed = text.text().trim();

                if !trimmed.is_empty() {
                    pieces.push(trimmed.to_owned());
                }
            }
            ChildOfElement::Element(inner) => collect_text(inner, pieces),
            _ => {}
        }
    }
}

/// Serialize a child node back to markup, escaping text content.
fn serialize_child(child: ChildOfElement<'_>, out: &mut String) {
    match child {
        ChildOfElement::Element(element) => {
            out.push('<');
            out.push_str(element.name().local_part());

            for attribute in element.attributes() {
                out.push(' ');
                out.push_str(attribute.name().local_part());
                out.push_str("=\"");
                out.push_str(&escape_xml(attribute.value()));
                out.push('"');
            }

            let children = element.children();

            if children.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');

                for inner in children {
                    serialize_child(inner, out);
                }

                out.push_str("</");
                out.push_str(element.name().local_part());
                out.push('>');
            }
        }
        ChildOfElement::Text(text) => out.push_str(&escape_xml(text.text())),
        ChildOfElement::Comment(comment) => {
            out.push_str("<!--");
            out.push_str(comment.text());
            out.push_str("-->");
        }
        ChildOfElement::ProcessingInstruction(_) => {}
    }
}

pub(crate) fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sxd_document::parser;

    fn parse(xml: &str) -> Package {
        parser::parse(xml).expect("well-formed test input")
    }

    #[test]
    fn first_match_returns_text_node() {
        let package = parse("<html><body><h1>Hello</h1></body></html>");
        let query = XPathQuery::compile("/html/body/h1/text()", false).unwrap();

        assert_eq!(query.get_first(&package).unwrap(), "Hello");
        assert!(query.get_bool(&package).unwrap());
    }

    #[test]
    fn text_only_flattens_nested_elements() {
        let package = parse("<r><p> a <b>b</b> c </p></r>");
        let query = XPathQuery::compile("/r/p", true).unwrap();

        assert_eq!(query.get_first(&package).unwrap(), "a b c");
    }

    #[test]
    fn markup_mode_serializes_subtrees() {
        let package = parse("<r><p>a<b>b</b></p></r>");
        let query = XPathQuery::compile("/r/p", false).unwrap();

        assert_eq!(query.get_first(&package).unwrap(), "a<b>b</b>");
    }

    #[test]
    fn attributes_bypass_the_flattener() {
        let package = parse(r#"<r><a href="/x">link</a></r>"#);
        let query = XPathQuery::compile("//a/@href", true).unwrap();

        assert_eq!(query.get_first(&package).unwrap(), "/x");
        assert_eq!(query.get_all(&package).unwrap(), vec!["/x"]);
    }

    #[test]
    fn all_matches_in_document_order() {
        let package = parse("<r><i>1</i><i>2</i><i>3</i></r>");
        let query = XPathQuery::compile("//i", true).unwrap();

        assert_eq!(query.get_all(&package).unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn no_match_yields_empty_results() {
        let package = parse("<r/>");
        let query = XPathQuery::compile("//missing", false).unwrap();

        assert!(!query.get_bool(&package).unwrap());
        assert_eq!(query.get_first(&package).unwrap(), "");
        assert!(query.get_all(&package).unwrap().is_empty());
    }

    #[test]
    fn string_typed_results() {
        let package = parse("<r><i>7</i></r>");
        let query = XPathQuery::compile("count(//i)", false).unwrap();

        assert_eq!(query.get_first(&package).unwrap(), "1");
    }
}
