//! The query engine.
//!
//! Compiles the four supported query languages once and evaluates them many
//! times against crawled content. Every query declares its result shapes
//! (boolean existence, first match, all matches, matching sub-documents);
//! evaluation never panics and treats runtime errors as warnings upstream.

pub mod jsonpath;
pub mod jsonpointer;
pub mod regex;
pub mod runner;
pub mod xpath;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jsonpath::JsonPathQuery;
pub use jsonpointer::JsonPointerQuery;
pub use regex::RegExQuery;
pub use runner::QueryRunner;
pub use xpath::XPathQuery;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query compile error: {0}")]
    Compile(String),
    #[error("query evaluation error: {0}")]
    Eval(String),
    #[error("query of type {query:?} cannot run against {target} input")]
    Unsupported {
        query: QueryType,
        target: &'static str,
    },
}

/// The supported query languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    RegEx,
    XPath,
    JsonPointer,
    JsonPath,
}

/// A stored query definition: language, source text, declared result shapes.
/// Immutable once compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProperties {
    pub query_type: QueryType,
    pub text: String,
    #[serde(default)]
    pub result_bool: bool,
    #[serde(default)]
    pub result_single: bool,
    #[serde(default)]
    pub result_multi: bool,
    #[serde(default)]
    pub result_subsets: bool,
    /// XPath only: flatten node results to their text content.
    #[serde(default)]
    pub text_only: bool,
}

/// One compiled query. Each variant owns its compiled representation.
#[derive(Debug)]
pub enum Query {
    RegEx(RegExQuery),
    XPath(XPathQuery),
    JsonPointer(JsonPointerQuery),
    JsonPath(JsonPathQuery),
}

/// A compiled query together with its stored definition.
#[derive(Debug)]
pub struct CompiledQuery {
    pub id: i64,
    pub props: QueryProperties,
    pub query: Query,
}

impl CompiledQuery {
    /// Compile a stored definition. Compile errors are fatal to the enclosing
    /// configuration and surface at worker initialization.
    pub fn compile(id: i64, props: QueryProperties) -> Result<Self, QueryError> {
        let query = match props.query_type {
            QueryType::RegEx => Query::RegEx(RegExQuery::compile(&props.text)?),
            QueryType::XPath => Query::XPath(XPathQuery::compile(&props.text, props.text_only)?),
            QueryType::JsonPointer => {
                Query::JsonPointer(JsonPointerQuery::compile(&props.text)?)
            }
            QueryType::JsonPath => Query::JsonPath(JsonPathQuery::compile(&props.text)?),
        };

        Ok(Self { id, props, query })
    }

    pub fn query_type(&self) -> QueryType {
        self.props.query_type
    }
}

/// Serialize a JSON value for query results: string leaves are returned
/// verbatim, everything else as its JSON representation.
pub(crate) fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(query_type: QueryType, text: &str) -> QueryProperties {
        QueryProperties {
            query_type,
            text: text.to_owned(),
            result_bool: true,
            result_single: true,
            result_multi: true,
            result_subsets: false,
            text_only: false,
        }
    }

    #[test]
    fn compile_all_variants() {
        assert!(CompiledQuery::compile(1, props(QueryType::RegEx, "a+")).is_ok());
        assert!(CompiledQuery::compile(2, props(QueryType::XPath, "/html/body")).is_ok());
        assert!(CompiledQuery::compile(3, props(QueryType::JsonPointer, "/a/0")).is_ok());
        assert!(CompiledQuery::compile(4, props(QueryType::JsonPath, "$.a[0]")).is_ok());
    }

    #[test]
    fn compile_errors_are_reported() {
        assert!(CompiledQuery::compile(1, props(QueryType::RegEx, "a(")).is_err());
        assert!(CompiledQuery::compile(2, props(QueryType::XPath, "///")).is_err());
        assert!(CompiledQuery::compile(4, props(QueryType::JsonPath, "not a path")).is_err());
    }

    #[test]
    fn json_leaves_serialize_by_type() {
        assert_eq!(json_value_to_string(&serde_json::json!("x")), "x");
        assert_eq!(json_value_to_string(&serde_json::json!(3)), "3");
        assert_eq!(json_value_to_string(&serde_json::json!({"a": 1})), "{\"a\":1}");
    }
}
