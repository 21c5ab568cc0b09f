//! Evaluation of compiled queries against a content blob through the
//! per-tick parser cache.
//!
//! This is the single place where query/input dispatch happens: the runner
//! picks the parsed artifact a query needs, triggers the lazy parse, and
//! converts evaluation errors into per-tick warnings so a bad query or bad
//! content never aborts a URL.

use serde_json::Value;

use crate::parse::ParserCache;

use super::{CompiledQuery, Query};

/// Stateless helper tying a query to the tick's parser cache.
pub struct QueryRunner;

impl QueryRunner {
    /// Boolean result: does the query match the content at all? Parse and
    /// evaluation failures count as "no match" and queue a warning.
    pub fn get_bool(query: &CompiledQuery, content: &str, cache: &mut ParserCache) -> bool {
        match &query.query {
            Query::RegEx(q) => match q.get_bool(content) {
                Ok(result) => result,
                Err(error) => warn_default(query, cache, error),
            },
            Query::XPath(q) => {
                if !cache.parse_xml(content) {
                    return false;
                }

                let result = cache.xml().map(|package| q.get_bool(package));

                match result {
                    Some(Ok(result)) => result,
                    Some(Err(error)) => warn_default(query, cache, error),
                    None => false,
                }
            }
            Query::JsonPointer(q) => match parsed_json(content, cache) {
                Some(doc) => match q.get_bool(&doc) {
                    Ok(result) => result,
                    Err(error) => warn_default(query, cache, error),
                },
                None => false,
            },
            Query::JsonPath(q) => match parsed_json(content, cache) {
                Some(doc) => match q.get_bool(&doc) {
                    Ok(result) => result,
                    Err(error) => warn_default(query, cache, error),
                },
                None => false,
            },
        }
    }

    /// First match as a string; empty string for no match or on error.
    pub fn get_first(query: &CompiledQuery, content: &str, cache: &mut ParserCache) -> String {
        match &query.query {
            Query::RegEx(q) => match q.get_first(content) {
                Ok(result) => result,
                Err(error) => {
                    warn_default(query, cache, error);

                    String::new()
                }
            },
            Query::XPath(q) => {
                if !cache.parse_xml(content) {
                    return String::new();
                }

                let result = cache.xml().map(|package| q.get_first(package));

                match result {
                    Some(Ok(result)) => result,
                    Some(Err(error)) => {
                        warn_default(query, cache, error);

                        String::new()
                    }
                    None => String::new(),
                }
            }
            Query::JsonPointer(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_first(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    String::new()
                }),
                None => String::new(),
            },
            Query::JsonPath(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_first(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    String::new()
                }),
                None => String::new(),
            },
        }
    }

    /// All matches in order; an empty list for no match or on error.
    pub fn get_all(query: &CompiledQuery, content: &str, cache: &mut ParserCache) -> Vec<String> {
        match &query.query {
            Query::RegEx(q) => match q.get_all(content) {
                Ok(results) => results,
                Err(error) => {
                    warn_default(query, cache, error);

                    Vec::new()
                }
            },
            Query::XPath(q) => {
                if !cache.parse_xml(content) {
                    return Vec::new();
                }

                let result = cache.xml().map(|package| q.get_all(package));

                match result {
                    Some(Ok(results)) => results,
                    Some(Err(error)) => {
                        warn_default(query, cache, error);

                        Vec::new()
                    }
                    None => Vec::new(),
                }
            }
            Query::JsonPointer(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_all(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    Vec::new()
                }),
                None => Vec::new(),
            },
            Query::JsonPath(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_all(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    Vec::new()
                }),
                None => Vec::new(),
            },
        }
    }

    /// Matching sub-documents, for JSON-backed queries only. Other variants
    /// queue a warning and return nothing.
    pub fn get_subsets(
        query: &CompiledQuery,
        content: &str,
        cache: &mut ParserCache,
    ) -> Vec<Value> {
        match &query.query {
            Query::JsonPointer(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_subsets(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    Vec::new()
                }),
                None => Vec::new(),
            },
            Query::JsonPath(q) => match parsed_json(content, cache) {
                Some(doc) => q.get_subsets(&doc).unwrap_or_else(|error| {
                    warn_default(query, cache, error);

                    Vec::new()
                }),
                None => Vec::new(),
            },
            _ => {
                cache.warn(format!(
                    "query #{} does not support sub-document results",
                    query.id
                ));

                Vec::new()
            }
        }
    }
}

/// Clone the parsed JSON document out of the cache so queries can run while
/// warnings are queued. Documents are parsed at most once per tick either
/// way.
fn parsed_json(content: &str, cache: &mut ParserCache) -> Option<Value> {
    if !cache.parse_json(content) {
        return None;
    }

    cache.json().cloned()
}

fn warn_default<T: std::fmt::Display>(
    query: &CompiledQuery,
    cache: &mut ParserCache,
    error: T,
) -> bool {
    cache.warn(format!("query #{}: {error}", query.id));

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompiledQuery, QueryProperties, QueryType};

    fn compile(query_type: QueryType, text: &str) -> CompiledQuery {
        CompiledQuery::compile(
            1,
            QueryProperties {
                query_type,
                text: text.to_owned(),
                result_bool: true,
                result_single: true,
                result_multi: true,
                result_subsets: false,
                text_only: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn xpath_query_on_html_content() {
        let mut cache = ParserCache::new();
        let query = compile(QueryType::XPath, "/html/body/h1");

        let result = QueryRunner::get_first(
            &query,
            "<html><body><h1>Hello</h1></body></html>",
            &mut cache,
        );

        assert_eq!(result, "Hello");
    }

    #[test]
    fn jsonpath_query_on_json_content() {
        let mut cache = ParserCache::new();
        let query = compile(QueryType::JsonPath, "$.items[*]");

        assert_eq!(
            QueryRunner::get_all(&query, r#"{"items": ["a", "b"]}"#, &mut cache),
            vec!["a", "b"]
        );
    }

    #[test]
    fn bad_content_queues_warning_and_yields_no_match() {
        let mut cache = ParserCache::new();
        let query = compile(QueryType::JsonPointer, "/a");

        assert!(!QueryRunner::get_bool(&query, "{broken", &mut cache));
        assert_eq!(cache.drain_warnings().len(), 1);
    }

    #[test]
    fn bool_first_all_agree_across_variants() {
        let content = r#"{"list": [1, 2]}"#;
        let mut cache = ParserCache::new();

        for (query_type, text) in [
            (QueryType::JsonPointer, "/list/$$"),
            (QueryType::JsonPath, "$.list[*]"),
            (QueryType::RegEx, r"\d"),
        ] {
            let query = compile(query_type, text);

            let b = QueryRunner::get_bool(&query, content, &mut cache);
            let first = QueryRunner::get_first(&query, content, &mut cache);
            let all = QueryRunner::get_all(&query, content, &mut cache);

            assert_eq!(b, !first.is_empty() || !all.is_empty());
        }
    }
}
