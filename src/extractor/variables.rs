//! Variable and token resolution for the extractor.
//!
//! Variables take their values from previously-parsed columns, the crawled
//! content, or the URL string itself; numeric variables may carry an alias
//! shifted by a constant. Tokens are resolved from auxiliary HTTP fetches;
//! tokens whose source depends on the paging variable are resolved per page.

use crate::config::VariableSource;
use crate::parse::ParserCache;
use crate::query::QueryRunner;
use crate::supervisor::WorkerError;

use super::{ExtractorWorker, IdString};

impl ExtractorWorker {
    /// Resolve all configured variables (and their aliases) for a URL.
    /// Returns `(name, value)` pairs in configuration order.
    pub(crate) async fn resolve_variables(
        &mut self,
        url: &IdString,
        content: &str,
    ) -> Result<Vec<(String, String)>, WorkerError> {
        let mut variables = Vec::new();
        let configs = self.config.variables.clone();

        for variable in &configs {
            let value = match variable.source {
                VariableSource::Parsed => {
                    if self.config.parsed_table.is_empty() {
                        self.log(&format!(
                            "WARNING: variable {:?} reads a parsed column, \
                             but no parsed table is configured",
                            variable.name
                        ))
                        .await;

                        String::new()
                    } else {
                        let table =
                            format!("{}_{}", self.ns, self.config.parsed_table);

                        self.db
                            .target_value(&table, url.0, &variable.parsed_column)
                            .await?
                            .unwrap_or_default()
                    }
                }
                VariableSource::Content => self.variable_from_query(&variable.name, content),
                VariableSource::Url => self.variable_from_query(&variable.name, &url.1),
            };

            // numeric aliases shift the value; non-numeric values alias
            // unchanged with a warning
            if !variable.alias.is_empty() {
                let alias_value = if variable.alias_add != 0 {
                    match value.trim().parse::<i64>() {
                        Ok(numeric) => (numeric + variable.alias_add).to_string(),
                        Err(_) => {
                            self.log(&format!(
                                "WARNING: could not create numeric alias {:?} \
                                 for non-numeric variable {:?} [= {value:?}]",
                                variable.alias, variable.name
                            ))
                            .await;

                            value.clone()
                        }
                    }
                } else {
                    value.clone()
                };

                variables.push((variable.name.clone(), value));
                variables.push((variable.alias.clone(), alias_value));
            } else {
                variables.push((variable.name.clone(), value));
            }
        }

        Ok(variables)
    }

    fn variable_from_query(&mut self, name: &str, input: &str) -> String {
        let Some(query) = self.queries.variables.get(name) else {
            self.cache
                .warn(format!("variable {name:?} has no extraction query"));

            return String::new();
        };

        if query.props.result_single {
            QueryRunner::get_first(query, input, &mut self.cache)
        } else if query.props.result_bool {
            QueryRunner::get_bool(query, input, &mut self.cache).to_string()
        } else {
            self.cache.warn(format!(
                "variable {name:?} query has no single or boolean result shape"
            ));

            String::new()
        }
    }

    /// Resolve tokens whose source does not depend on the paging variable.
    /// Appended to the variable list so later substitutions see them.
    pub(crate) async fn resolve_global_tokens(
        &mut self,
        variables: &mut Vec<(String, String)>,
    ) {
        let tokens = self.config.tokens.clone();
        let paging = self.config.paging_variable.clone();

        for token in &tokens {
            if !paging.is_empty() && token.source.contains(&paging) {
                // deferred to the page loop
                continue;
            }

            let value = self
                .token_value(&token.name, &token.source, token.use_post, variables)
                .await;

            variables.push((token.name.clone(), value));
        }
    }

    /// Resolve tokens whose source contains the paging variable, with the
    /// current page value substituted.
    pub(crate) async fn resolve_page_tokens(
        &mut self,
        page: &str,
        variables: &[(String, String)],
    ) -> Vec<(String, String)> {
        let paging = self.config.paging_variable.clone();

        if paging.is_empty() {
            return Vec::new();
        }

        let tokens = self.config.tokens.clone();
        let mut resolved = Vec::new();

        for token in &tokens {
            if !token.source.contains(&paging) {
                continue;
            }

            let source = token.source.replace(&paging, page);

            let value = self
                .token_value(&token.name, &source, token.use_post, variables)
                .await;

            resolved.push((token.name.clone(), value));
        }

        resolved
    }

    /// Fetch and evaluate one token source. The source URL is itself subject
    /// to variable substitution; a failed fetch yields the empty string.
    async fn token_value(
        &mut self,
        name: &str,
        source: &str,
        use_post: bool,
        variables: &[(String, String)],
    ) -> String {
        let mut source = source.to_owned();

        for (variable, value) in variables {
            source = source.replace(variable, value);
        }

        let source_url = format!("{}://{source}", self.config.network.scheme());

        let content = match self.client.fetch(&source_url, use_post).await {
            Ok(content) => content,
            Err(error) => {
                self.log(&format!(
                    "WARNING: could not fetch token source for {name}: {error}"
                ))
                .await;

                return String::new();
            }
        };

        self.idle_accum += self.client.last_rate_sleep();

        let Some(query) = self.queries.tokens.get(name) else {
            return String::new();
        };

        // token sources get their own parser scratchpad
        let mut cache = ParserCache::new();

        let value = if query.props.result_single {
            QueryRunner::get_first(query, &content, &mut cache)
        } else if query.props.result_bool {
            QueryRunner::get_bool(query, &content, &mut cache).to_string()
        } else {
            String::new()
        };

        for warning in cache.drain_warnings() {
            self.log(&format!("WARNING: {warning} [token {name}]")).await;
        }

        value
    }
}
