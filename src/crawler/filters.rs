//! Per-URL filter pipelines and the crawl-content step.

use crate::parse::ParserCache;
use crate::query::QueryRunner;
use crate::supervisor::WorkerError;
use crate::config::ExpectedPolicy;

use super::{CrawlerWorker, IdString, passes_filters};

impl CrawlerWorker {
    /// Fetch and process one URL. Returns whether the content was crawled
    /// successfully; skip and retry bookkeeping happens inside.
    pub(crate) async fn crawl_content(
        &mut self,
        url: &IdString,
        use_post: bool,
    ) -> Result<bool, WorkerError> {
        // URL filters run before the fetch
        if !self.check_url(&url.1) {
            self.log(&format!("URL filtered out - skips... [{}]", url.1))
                .await;
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        let scheme = self.config.network.scheme();
        let fetch_url = match &self.domain {
            Some(domain) => format!("{scheme}://{domain}{}", url.1),
            None => format!("{scheme}://{}", url.1),
        };

        let body = match self.client.fetch(&fetch_url, use_post).await {
            Ok(body) => body,
            Err(error) => {
                self.handle_fetch_error(url, error).await;

                return Ok(false);
            }
        };

        let code = self.client.response_code();

        if !self.check_response_code(&url.1, code).await {
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        let content_type = self.client.content_type().to_owned();

        if !self.check_content_type(&content_type) {
            self.log(&format!(
                "content type {content_type:?} filtered out - skips... [{}]",
                url.1
            ))
            .await;
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        if !self.check_content(&body) {
            self.log(&format!("content filtered out - skips... [{}]", url.1))
                .await;
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        if !self.check_canonical(&url.1, &body) {
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        // store the repaired form when HTML tidying is enabled
        let stored_body = if self.config.tidy_html && self.cache.parse_xml(&body) {
            self.cache
                .repaired_xhtml()
                .map(str::to_owned)
                .unwrap_or_else(|| body.clone())
        } else {
            body.clone()
        };

        self.db
            .save_content(&self.ns, url.0, code, &content_type, &stored_body)
            .await?;

        // link extraction + insertion of newly discovered URLs
        let links = self.extract_urls(&url.1, &body);

        if !self.check_expected(&url.1, &body, links.len()).await? {
            self.crawling_skip(url, true).await;

            return Ok(false);
        }

        let added = self.insert_urls(&links).await?;

        if self.config.verbose && !links.is_empty() {
            self.log(&format!(
                "checked {} and added {added} URL(s) [{}]",
                links.len(),
                url.1
            ))
            .await;
        }

        Ok(true)
    }

    /// URL white/blacklist (RegEx on the canonical URL string).
    pub(crate) fn check_url(&mut self, url: &str) -> bool {
        passes_filters(
            &self.queries.whitelist_url,
            &self.queries.blacklist_url,
            url,
            &mut self.cache,
        )
    }

    /// Content-type white/blacklist (RegEx on the `Content-Type` header).
    pub(crate) fn check_content_type(&mut self, content_type: &str) -> bool {
        passes_filters(
            &self.queries.whitelist_type,
            &self.queries.blacklist_type,
            content_type,
            &mut self.cache,
        )
    }

    /// Content white/blacklist, any supported query language.
    pub(crate) fn check_content(&mut self, content: &str) -> bool {
        passes_filters(
            &self.queries.whitelist_content,
            &self.queries.blacklist_content,
            content,
            &mut self.cache,
        )
    }

    /// Canonical check: when configured, the page must declare itself
    /// canonical for the crawled URL (or declare nothing at all).
    pub(crate) fn check_canonical(&mut self, url: &str, content: &str) -> bool {
        let Some(query) = &self.queries.canonical else {
            return true;
        };

        let declared = QueryRunner::get_first(query, content, &mut self.cache);

        if declared.is_empty() || declared == url || declared.ends_with(url) {
            return true;
        }

        self.cache.warn(format!(
            "canonical check failed: page declares {declared:?}"
        ));

        false
    }

    /// Expected-number-of-links consistency check.
    pub(crate) async fn check_expected(
        &mut self,
        url: &str,
        content: &str,
        found: usize,
    ) -> Result<bool, WorkerError> {
        let Some(query) = &self.queries.expected else {
            return Ok(true);
        };

        let raw = QueryRunner::get_first(query, content, &mut self.cache);

        let Ok(expected) = raw.trim().parse::<usize>() else {
            if !raw.is_empty() {
                self.log(&format!(
                    "WARNING: expected-count query returned {raw:?} [{url}]"
                ))
                .await;
            }

            return Ok(true);
        };

        if expected == found {
            return Ok(true);
        }

        let mismatch =
            format!("expected {expected} URL(s), extracted {found} [{url}]");

        match self.config.expected_policy {
            ExpectedPolicy::Warn => {
                self.log(&format!("WARNING: {mismatch}")).await;

                Ok(true)
            }
            ExpectedPolicy::Smaller if found < expected => {
                self.log(&format!("ERROR: {mismatch}")).await;

                Ok(false)
            }
            ExpectedPolicy::Larger if found > expected => {
                self.log(&format!("ERROR: {mismatch}")).await;

                Ok(false)
            }
            _ => {
                self.log(&format!("WARNING: {mismatch}")).await;

                Ok(true)
            }
        }
    }
}

/// Standalone filter evaluation, also used by tests.
pub fn filter_matches(
    whitelist: &[crate::query::CompiledQuery],
    blacklist: &[crate::query::CompiledQuery],
    input: &str,
) -> bool {
    let mut cache = ParserCache::new();

    passes_filters(whitelist, blacklist, input, &mut cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompiledQuery, QueryProperties, QueryType};

    fn regex_query(id: i64, pattern: &str) -> CompiledQuery {
        CompiledQuery::compile(
            id,
            QueryProperties {
                query_type: QueryType::RegEx,
                text: pattern.to_owned(),
                result_bool: true,
                result_single: false,
                result_multi: false,
                result_subsets: false,
                text_only: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn whitelist_requires_a_match() {
        let whitelist = vec![regex_query(1, r"^/articles/")];

        assert!(filter_matches(&whitelist, &[], "/articles/2020/x"));
        assert!(!filter_matches(&whitelist, &[], "/about"));
    }

    #[test]
    fn blacklist_rejects_matches() {
        let blacklist = vec![regex_query(1, r"\.pdf$")];

        assert!(filter_matches(&[], &blacklist, "/doc.html"));
        assert!(!filter_matches(&[], &blacklist, "/doc.pdf"));
    }

    #[test]
    fn empty_filters_pass_everything() {
        assert!(filter_matches(&[], &[], "anything"));
    }

    #[test]
    fn content_type_filtering() {
        let whitelist = vec![regex_query(1, r"^text/html")];

        assert!(filter_matches(&whitelist, &[], "text/html"));
        assert!(!filter_matches(&whitelist, &[], "application/pdf"));
    }
}
