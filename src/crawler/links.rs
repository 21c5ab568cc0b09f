//! Link extraction and insertion of discovered URLs.

use std::collections::HashSet;

use crate::query::QueryRunner;
use crate::supervisor::WorkerError;
use crate::urlparse::looks_like_file;

use super::CrawlerWorker;

impl CrawlerWorker {
    /// Run the link-extraction queries against the body and resolve every
    /// result to a canonical in-domain URL. The output is deduplicated and
    /// keeps extraction order.
    pub(crate) fn extract_urls(&mut self, base_url: &str, content: &str) -> Vec<String> {
        if self.resolver.set_current_url(base_url).is_err() {
            self.cache
                .warn(format!("could not use {base_url:?} as a base URL"));

            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for query in &self.queries.links {
            if !query.props.result_multi {
                self.cache.warn(format!(
                    "link query #{} has no multi-result shape",
                    query.id
                ));

                continue;
            }

            for link in QueryRunner::get_all(query, content, &mut self.cache) {
                if self.config.log_file_hrefs && looks_like_file(&link) {
                    log::debug!(
                        target: "siteharvest::links",
                        "link appears to point at a file: {link}"
                    );
                }

                match self.resolver.resolve(&link) {
                    Ok(Some(resolved)) => {
                        if seen.insert(resolved.clone()) {
                            results.push(resolved);
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        self.cache.warn(format!("{error} in link {link:?}"));
                    }
                }
            }
        }

        results
    }

    /// Insert missing URLs into the list in chunks; optionally run the
    /// duplicate-hash check afterwards.
    pub(crate) async fn insert_urls(&mut self, urls: &[String]) -> Result<u64, WorkerError> {
        if urls.is_empty() {
            return Ok(0);
        }

        let added = self
            .db
            .add_urls_chunked(&self.ns, urls, self.config.url_chunk_size)
            .await?;

        if self.config.check_duplicate_hashes {
            let duplicates = self.db.duplicate_hashes(&self.ns).await?;

            if !duplicates.is_empty() {
                self.log(&format!(
                    "WARNING: {} hash value(s) shared by multiple URLs",
                    duplicates.len()
                ))
                .await;
            }
        }

        Ok(added)
    }
}
