//! JSONPointer queries over parsed JSON documents.
//!
//! Extends RFC 6901 with the literal token `$$` as an array-index wildcard:
//! evaluating "all matches" substitutes increasing integers for `$$` and
//! stops at the first index with no element.

use serde_json::Value;

use super::{QueryError, json_value_to_string};

#[derive(Debug)]
pub struct JsonPointerQuery {
    /// Pointer with `$$` replaced by `0`, used for bool/first evaluation.
    pointer_first: String,
    /// Original pointer text when it contains the `$$` wildcard.
    pointer_multi: Option<String>,
}

impl JsonPointerQuery {
    pub fn compile(pointer: &str) -> Result<Self, QueryError> {
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(QueryError::Compile(format!(
                "JSONPointer must start with '/': {pointer:?}"
            )));
        }

        let pointer_multi = pointer.contains("$$").then(|| pointer.to_owned());

        Ok(Self {
            pointer_first: pointer.replace("$$", "0"),
            pointer_multi,
        })
    }

    /// Does the pointer resolve to any value?
    pub fn get_bool(&self, doc: &Value) -> Result<bool, QueryError> {
        Ok(doc.pointer(&self.pointer_first).is_some())
    }

    /// First match, or the empty string for no match.
    pub fn get_first(&self, doc: &Value) -> Result<String, QueryError> {
        Ok(doc
            .pointer(&self.pointer_first)
            .map(json_value_to_string)
            .unwrap_or_default())
    }

    /// All matches. Without the `$$` wildcard this is at most the first
    /// match; with it, the wildcard iterates from zero until an index is
    /// missing.
    pub fn get_all(&self, doc: &Value) -> Result<Vec<String>, QueryError> {
        match &self.pointer_multi {
            None => {
                let first = self.get_first(doc)?;

                Ok(if first.is_empty() { Vec::new() } else { vec![first] })
            }
            Some(template) => {
                let mut results = Vec::new();
                let mut index = 0usize;

                loop {
                    let pointer = template.replace("$$", &index.to_string());

                    match doc.pointer(&pointer) {
                        Some(value) => results.push(json_value_to_string(value)),
                        None => break,
                    }

                    index += 1;
                }

                Ok(results)
            }
        }
    }

    /// Matching sub-documents, cloned out of the parsed document.
    pub fn get_subsets(&self, doc: &Value) -> Result<Vec<Value>, QueryError> {
        match &self.pointer_multi {
            None => Ok(doc
                .pointer(&self.pointer_first)
                .cloned()
                .into_iter()
                .collect()),
            Some(template) => {
                let mut results = Vec::new();
                let mut index = 0usize;

                loop {
                    let pointer = template.replace("$$", &index.to_string());

                    match doc.pointer(&pointer) {
                        Some(value) => results.push(value.clone()),
                        None => break,
                    }

                    index += 1;
                }

                Ok(results)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_pointer_lookup() {
        let doc = json!({"a": {"b": "x"}, "n": 3});
        let query = JsonPointerQuery::compile("/a/b").unwrap();

        assert!(query.get_bool(&doc).unwrap());
        assert_eq!(query.get_first(&doc).unwrap(), "x");
        assert_eq!(query.get_all(&doc).unwrap(), vec!["x"]);

        let number = JsonPointerQuery::compile("/n").unwrap();

        assert_eq!(number.get_first(&doc).unwrap(), "3");
    }

    #[test]
    fn wildcard_iterates_until_missing() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}, {"id": 3}]});
        let query = JsonPointerQuery::compile("/items/$$/id").unwrap();

        assert_eq!(query.get_all(&doc).unwrap(), vec!["1", "2", "3"]);
        assert_eq!(query.get_first(&doc).unwrap(), "1");
        assert!(query.get_bool(&doc).unwrap());
    }

    #[test]
    fn wildcard_subsets_clone_documents() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}]});
        let query = JsonPointerQuery::compile("/items/$$").unwrap();

        let subsets = query.get_subsets(&doc).unwrap();

        assert_eq!(subsets.len(), 2);
        assert_eq!(subsets[0], json!({"id": 1}));
    }

    #[test]
    fn missing_pointer_yields_empty_results() {
        let doc = json!({"a": 1});
        let query = JsonPointerQuery::compile("/missing").unwrap();

        assert!(!query.get_bool(&doc).unwrap());
        assert_eq!(query.get_first(&doc).unwrap(), "");
        assert!(query.get_all(&doc).unwrap().is_empty());
    }

    #[test]
    fn pointer_must_start_with_slash() {
        assert!(JsonPointerQuery::compile("a/b").is_err());
        assert!(JsonPointerQuery::compile("").is_ok());
    }
}
