//! JSONPath queries over parsed JSON documents.

use serde_json::Value;
use serde_json_path::JsonPath;

use super::{QueryError, json_value_to_string};

#[derive(Debug)]
pub struct JsonPathQuery {
    path: JsonPath,
}

impl JsonPathQuery {
    pub fn compile(path: &str) -> Result<Self, QueryError> {
        if path.is_empty() {
            return Err(QueryError::Compile("empty JSONPath".to_owned()));
        }

        Ok(Self {
            path: JsonPath::parse(path).map_err(|e| QueryError::Compile(e.to_string()))?,
        })
    }

    pub fn get_bool(&self, doc: &Value) -> Result<bool, QueryError> {
        Ok(!self.path.query(doc).is_empty())
    }

    pub fn get_first(&self, doc: &Value) -> Result<String, QueryError> {
        Ok(self
            .path
            .query(doc)
            .first()
            .map(json_value_to_string)
            .unwrap_or_default())
    }

    /// All matches in document order.
    pub fn get_all(&self, doc: &Value) -> Result<Vec<String>, QueryError> {
        Ok(self
            .path
            .query(doc)
            .all()
            .into_iter()
            .map(json_value_to_string)
            .collect())
    }

    pub fn get_subsets(&self, doc: &Value) -> Result<Vec<Value>, QueryError> {
        Ok(self
            .path
            .query(doc)
            .all()
            .into_iter()
            .cloned()
            .collect())
    }
}
