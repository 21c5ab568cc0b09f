//! Custom-URL initialization: counter expansion and token substitution.

use crate::parse::ParserCache;
use crate::query::QueryRunner;
use crate::supervisor::WorkerError;
use crate::config::CounterConfig;

use super::{CrawlerWorker, IdString};

impl CrawlerWorker {
    /// Expand the configured custom URL templates through their counters,
    /// insert them (and the start page) into the URL list and resolve their
    /// ids.
    pub(crate) async fn init_custom_urls(&mut self) -> Result<(), WorkerError> {
        let mut urls = if self.config.counters.is_empty() {
            self.config.custom_urls.clone()
        } else if self.config.counters_global {
            expand_global(&self.config.custom_urls, &self.config.counters)
        } else {
            expand_local(&self.config.custom_urls, &self.config.counters)
        };

        urls.sort();
        urls.dedup();

        let mut to_insert = urls.clone();

        if !self.config.start_ignore && !self.config.start_page.is_empty() {
            to_insert.push(self.config.start_page.clone());
        }

        self.db.add_urls(&self.ns, &to_insert).await?;

        self.custom_pages = Vec::with_capacity(urls.len());

        for url in urls {
            let id = self
                .db
                .url_id(&self.ns, &url)
                .await?
                .ok_or_else(|| WorkerError::Fatal(format!("custom URL {url:?} not in list")))?;

            self.custom_pages.push((id, url));
        }

        if !self.config.start_ignore && !self.config.start_page.is_empty() {
            let id = self
                .db
                .url_id(&self.ns, &self.config.start_page)
                .await?
                .ok_or_else(|| {
                    WorkerError::Fatal(format!(
                        "start page {:?} not in list",
                        self.config.start_page
                    ))
                })?;

            self.start_page = (id, self.config.start_page.clone());
        } else {
            self.start_crawled = true;
        }

        Ok(())
    }

    /// Substitute `${NAME}` token placeholders in a manual URL. Each token's
    /// value comes from an auxiliary HTTP fetch plus a query; a failed fetch
    /// substitutes the empty string and logs a warning.
    pub(crate) async fn replace_tokens(&mut self, url: &IdString) -> Result<IdString, WorkerError> {
        if self.config.tokens.is_empty() {
            return Ok(url.clone());
        }

        let mut result = url.1.clone();
        let tokens = self.config.tokens.clone();

        for token in &tokens {
            if !result.contains(&token.name) {
                continue;
            }

            let value = self.token_value(&token.source, token.use_post, &token.name).await;

            result = result.replace(&token.name, &value);
        }

        Ok((url.0, result))
    }

    /// Fetch and evaluate one token source.
    pub(crate) async fn token_value(
        &mut self,
        source: &str,
        use_post: bool,
        name: &str,
    ) -> String {
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

        // token sources get their own parser scratchpad; the tick cache
        // belongs to the crawled URL
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

/// Expand each template through the first counter whose variable it
/// contains: one template produces all values of that counter.
fn expand_local(templates: &[String], counters: &[CounterConfig]) -> Vec<String> {
    let mut result = Vec::new();

    for template in templates {
        match counters
            .iter()
            .find(|counter| template.contains(&counter.variable))
        {
            Some(counter) => result.extend(expand_one(template, counter)),
            None => result.push(template.clone()),
        }
    }

    result
}

/// Multiply every template by every counter (cross product).
fn expand_global(templates: &[String], counters: &[CounterConfig]) -> Vec<String> {
    let mut result: Vec<String> = templates.to_vec();

    for counter in counters {
        result = result
            .iter()
            .flat_map(|template| expand_one(template, counter))
            .collect();
    }

    result
}

fn expand_one(template: &str, counter: &CounterConfig) -> Vec<String> {
    if counter.step == 0 || !template.contains(&counter.variable) {
        return vec![template.to_owned()];
    }

    let mut result = Vec::new();
    let mut value = counter.start;

    loop {
        let past_end = if counter.step > 0 {
            value > counter.end
        } else {
            value < counter.end
        };

        if past_end {
            break;
        }

        let mut url = template.replace(&counter.variable, &value.to_string());

        if !counter.alias.is_empty() {
            url = url.replace(&counter.alias, &(value + counter.alias_add).to_string());
        }

        result.push(url);

        value += counter.step;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(variable: &str, start: i64, end: i64, step: i64) -> CounterConfig {
        CounterConfig {
            variable: variable.to_owned(),
            start,
            end,
            step,
            alias: String::new(),
            alias_add: 0,
        }
    }

    #[test]
    fn counter_expands_inclusive_range() {
        let urls = expand_one("/page?p=${n}", &counter("${n}", 1, 3, 1));

        assert_eq!(urls, vec!["/page?p=1", "/page?p=2", "/page?p=3"]);
    }

    #[test]
    fn negative_step_counts_down() {
        let urls = expand_one("/p/${n}", &counter("${n}", 3, 1, -1));

        assert_eq!(urls, vec!["/p/3", "/p/2", "/p/1"]);
    }

    #[test]
    fn alias_substitutes_shifted_value() {
        let urls = expand_one(
            "/p?from=${n}&to=${m}",
            &CounterConfig {
                variable: "${n}".to_owned(),
                start: 0,
                end: 10,
                step: 10,
                alias: "${m}".to_owned(),
                alias_add: 9,
            },
        );

        assert_eq!(urls, vec!["/p?from=0&to=9", "/p?from=10&to=19"]);
    }

    #[test]
    fn local_expansion_uses_first_matching_counter() {
        let urls = expand_local(
            &["/a/${x}".to_owned(), "/plain".to_owned()],
            &[counter("${x}", 1, 2, 1), counter("${y}", 5, 6, 1)],
        );

        assert_eq!(urls, vec!["/a/1", "/a/2", "/plain"]);
    }

    #[test]
    fn global_expansion_multiplies_counters() {
        let urls = expand_global(
            &["/a/${x}/${y}".to_owned()],
            &[counter("${x}", 1, 2, 1), counter("${y}", 5, 6, 1)],
        );

        assert_eq!(urls, vec!["/a/1/5", "/a/1/6", "/a/2/5", "/a/2/6"]);
    }

    #[test]
    fn zero_step_leaves_the_template_alone() {
        let urls = expand_one("/p/${n}", &counter("${n}", 1, 5, 0));

        assert_eq!(urls, vec!["/p/${n}"]);
    }
}
