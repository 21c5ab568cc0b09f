//! Perl-compatible regular expression queries over plain text.

use fancy_regex::Regex;

use super::QueryError;

/// A compiled regular expression query. Uses an engine with lookaround and
/// backreference support, so evaluation itself is fallible (backtracking
/// limits) and mapped to [`QueryError::Eval`].
#[derive(Debug)]
pub struct RegExQuery {
    regex: Regex,
}

impl RegExQuery {
    pub fn compile(pattern: &str) -> Result<Self, QueryError> {
        Ok(Self {
            regex: Regex::new(pattern).map_err(|e| QueryError::Compile(e.to_string()))?,
        })
    }

    /// Does the pattern match anywhere?
    pub fn get_bool(&self, content: &str) -> Result<bool, QueryError> {
        self.regex
            .is_match(content)
            .map_err(|e| QueryError::Eval(e.to_string()))
    }

    /// First full match, or the empty string if there is none.
    pub fn get_first(&self, content: &str) -> Result<String, QueryError> {
        Ok(self
            .regex
            .find(content)
            .map_err(|e| QueryError::Eval(e.to_string()))?
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default())
    }

    /// All full matches in order. An empty list is a valid result.
    pub fn get_all(&self, content: &str) -> Result<Vec<String>, QueryError> {
        let mut results = Vec::new();

        for m in self.regex.find_iter(content) {
            results.push(
                m.map_err(|e| QueryError::Eval(e.to_string()))?
                    .as_str()
                    .to_owned(),
            );
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_first_all_agree() {
        let query = RegExQuery::compile(r"\d+").unwrap();

        assert!(query.get_bool("a 12 b 345").unwrap());
        assert_eq!(query.get_first("a 12 b 345").unwrap(), "12");
        assert_eq!(query.get_all("a 12 b 345").unwrap(), vec!["12", "345"]);

        assert!(!query.get_bool("none").unwrap());
        assert_eq!(query.get_first("none").unwrap(), "");
        assert!(query.get_all("none").unwrap().is_empty());
    }

    #[test]
    fn lookahead_patterns_compile() {
        let query = RegExQuery::compile(r"foo(?=bar)").unwrap();

        assert_eq!(query.get_first("foobar").unwrap(), "foo");
        assert!(!query.get_bool("foobaz").unwrap());
    }

    #[test]
    fn invalid_pattern_is_a_compile_error() {
        assert!(matches!(
            RegExQuery::compile("(unclosed"),
            Err(QueryError::Compile(_))
        ));
    }
}
