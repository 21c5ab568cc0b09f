//! Per-tick content parser cache.
//!
//! Both the crawler and the extractor hold one of these per worker. Within a
//! single URL tick, each parser runs at most once per content blob; the first
//! consumer pays the parse cost and later consumers reuse the artifact.
//! Parse errors never abort a tick: they are recorded and flushed as
//! warnings at the end of the URL.

pub mod html;

use sxd_document::Package;

pub use html::repair_html;

/// Outcome of one lazy parse: the artifact, or the recorded error message.
enum Parsed<T> {
    Ok(T),
    Failed,
}

/// Lazy per-tick parser state. Reset at the start of every URL tick.
#[derive(Default)]
pub struct ParserCache {
    xml: Option<Parsed<Package>>,
    json: Option<Parsed<serde_json::Value>>,
    /// Repaired XHTML of the last successful XML parse, for storage when the
    /// website is configured to keep the tidied form.
    repaired: Option<String>,
    warnings: Vec<String>,
}

impl ParserCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached artifacts and queued warnings.
    pub fn reset(&mut self) {
        self.xml = None;
        self.json = None;
        self.repaired = None;
        self.warnings.clear();
    }

    /// Parse content as HTML/XML if not yet done this tick. Returns whether a
    /// parsed tree is available.
    pub fn parse_xml(&mut self, content: &str) -> bool {
        if self.xml.is_none() {
            let repaired = html::repair_html(content);

            match sxd_document::parser::parse(&repaired) {
                Ok(package) => {
                    self.repaired = Some(repaired);
                    self.xml = Some(Parsed::Ok(package));
                }
                Err(error) => {
                    self.warnings.push(format!("XML parsing error: {error}"));
                    self.xml = Some(Parsed::Failed);
                }
            }
        }

        matches!(self.xml, Some(Parsed::Ok(_)))
    }

    /// The parsed XML tree, if `parse_xml` succeeded this tick.
    pub fn xml(&self) -> Option<&Package> {
        match &self.xml {
            Some(Parsed::Ok(package)) => Some(package),
            _ => None,
        }
    }

    /// The repaired XHTML serialization backing the parsed tree.
    pub fn repaired_xhtml(&self) -> Option<&str> {
        self.repaired.as_deref()
    }

    /// Parse content as JSON if not yet done this tick. Returns whether a
    /// parsed document is available.
    pub fn parse_json(&mut self, content: &str) -> bool {
        if self.json.is_none() {
            match serde_json::from_str(content) {
                Ok(value) => self.json = Some(Parsed::Ok(value)),
                Err(error) => {
                    self.warnings.push(format!("JSON parsing error: {error}"));
                    self.json = Some(Parsed::Failed);
                }
            }
        }

        matches!(self.json, Some(Parsed::Ok(_)))
    }

    /// The parsed JSON document, if `parse_json` succeeded this tick.
    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.json {
            Some(Parsed::Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Record an evaluation warning for the end-of-tick flush.
    pub fn warn(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Take all queued warnings, leaving the cache parse state intact.
    pub fn drain_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_parses_once_and_is_cached() {
        let mut cache = ParserCache::new();

        assert!(cache.parse_xml("<html><body><h1>x</h1></body></html>"));
        assert!(cache.xml().is_some());

        // second call is a no-op on the cached artifact
        assert!(cache.parse_xml("ignored"));
    }

    #[test]
    fn json_error_is_queued_not_thrown() {
        let mut cache = ParserCache::new();

        assert!(!cache.parse_json("{not json"));
        assert!(cache.json().is_none());

        let warnings = cache.drain_warnings();

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("JSON parsing error"));

        // error outcome is cached too
        assert!(!cache.parse_json("{not json"));
        assert!(cache.drain_warnings().is_empty());
    }

    #[test]
    fn reset_clears_artifacts_and_warnings() {
        let mut cache = ParserCache::new();

        cache.parse_json("{\"a\": 1}");
        cache.warn("w".to_owned());
        cache.reset();

        assert!(cache.json().is_none());
        assert!(cache.drain_warnings().is_empty());
        assert!(cache.parse_json("[1, 2]"));
    }
}
