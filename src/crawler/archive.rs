//! Memento-protocol archive ingestion.
//!
//! For every configured archive source, the crawler fetches the timemap of
//! the current URL, walks its mementos, saves archived content blobs and
//! runs link extraction on them with a relaxed parsing rule. Retries are
//! per-memento: a failed archive never invalidates the crawl of the live
//! URL.

use crate::datetime::{compact_to_sql, long_date_to_sql, sql_to_compact};
use crate::net::FetchError;
use crate::supervisor::WorkerError;
use crate::config::ArchiveConfig;

use super::{CrawlerWorker, IdString};

/// Marker an archive returns instead of content when the capture lives at
/// another timestamp.
const CAPTURE_REDIRECT: &str = "found capture at ";

/// Timemap media type per the Memento protocol.
const LINK_FORMAT: &str = "application/link-format";

/// One memento of a timemap: URI plus its capture timestamp (SQL form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    pub url: String,
    pub timestamp: String,
}

impl CrawlerWorker {
    /// Walk all configured archives for the current URL. Returns whether the
    /// URL lock survived (a lost lock means another worker took over and the
    /// URL cannot be marked finished).
    pub(crate) async fn crawl_archives(&mut self, url: &IdString) -> Result<bool, WorkerError> {
        if !self.config.archives || self.archive_client.is_none() {
            return Ok(true);
        }

        if self.config.verbose {
            self.log(&format!("gets archives of {}...", url.1)).await;
        }

        let sources = self.config.archive_sources.clone();
        let status_before = self.state.status();

        for source in &sources {
            if source.timemap_url.is_empty() || source.memento_url.is_empty() {
                continue;
            }

            if !self.crawl_archive_source(url, source, &status_before).await? {
                return Ok(false);
            }

            if !self.state.is_running() {
                break;
            }
        }

        self.state.set_status(status_before);

        Ok(true)
    }

    /// Walk one archive source, rotating through timemap pages. Returns
    /// whether the URL lock is still held.
    async fn crawl_archive_source(
        &mut self,
        url: &IdString,
        source: &ArchiveConfig,
        status_before: &str,
    ) -> Result<bool, WorkerError> {
        let mut timemap_url = format!(
            "{}{}{}",
            source.timemap_url,
            self.domain_prefix(),
            url.1
        );

        while self.state.is_running() {
            let Some((content, code, content_type)) = self.fetch_archive(&timemap_url).await
            else {
                return Ok(true);
            };

            if !(200..300).contains(&code) {
                self.log(&format!(
                    "archive {} returned HTTP {code} for timemap",
                    source.name
                ))
                .await;

                return Ok(true);
            }

            if content_type != LINK_FORMAT || content.is_empty() {
                return Ok(true);
            }

            let (mementos, next_page, warnings) = parse_mementos(&content);

            for warning in warnings {
                self.log(&format!(
                    "Memento parsing WARNING: {warning} [{}]",
                    url.1
                ))
                .await;
            }

            let total = mementos.len();

            for (index, memento) in mementos.into_iter().enumerate() {
                if !self.state.is_running() {
                    return Ok(true);
                }

                self.state.set_status(format!(
                    "[{}: {}/{}] {}",
                    source.name,
                    index + 1,
                    total,
                    status_before
                ));

                // keep the URL lease alive through a long memento walk
                match self
                    .locks
                    .lock_if_ok(url.0, &self.lock, self.config.lock_secs)
                    .await?
                {
                    Some(lease) => self.lock = lease,
                    None => {
                        self.log(&format!(
                            "lost URL lock during archive walk [{}]",
                            url.1
                        ))
                        .await;

                        return Ok(false);
                    }
                }

                self.crawl_memento(url, source, memento).await?;
            }

            match next_page {
                Some(next) => timemap_url = next,
                None => break,
            }
        }

        Ok(true)
    }

    /// Fetch and store one memento, following `found capture at` redirects
    /// up to the configured depth.
    async fn crawl_memento(
        &mut self,
        url: &IdString,
        source: &ArchiveConfig,
        memento: Memento,
    ) -> Result<(), WorkerError> {
        let mut memento_url = memento.url;
        let mut timestamp = memento.timestamp;
        let mut depth = 0u32;

        while self.state.is_running() {
            if self
                .db
                .archived_content_exists(&self.ns, url.0, &source.name, &timestamp)
                .await?
            {
                return Ok(());
            }

            let Some((content, code, content_type)) = self.fetch_archive(&memento_url).await
            else {
                return Ok(());
            };

            if (400..=599).contains(&code) {
                self.log(&format!("HTTP error {code} from {memento_url} - skips..."))
                    .await;

                return Ok(());
            }

            if let Some(rest) = content.strip_prefix(CAPTURE_REDIRECT) {
                // the capture lives at another timestamp: rewrite the URL
                // and re-fetch, within the depth bound
                depth += 1;

                if depth > self.config.archive_redirect_depth {
                    self.log(&format!(
                        "too many capture redirects from {} - skips... [{}]",
                        source.name, url.1
                    ))
                    .await;

                    return Ok(());
                }

                let new_compact: String = rest.chars().take(14).collect();

                let Some(old_compact) = sql_to_compact(&timestamp) else {
                    return Ok(());
                };

                let Some(position) = memento_url.find(&old_compact) else {
                    self.log(&format!(
                        "WARNING: could not find timestamp in {memento_url} [{}]",
                        url.1
                    ))
                    .await;

                    return Ok(());
                };

                let Some(new_timestamp) = compact_to_sql(&new_compact) else {
                    self.log(&format!(
                        "WARNING: invalid timestamp {new_compact:?} from {} [{}]",
                        source.name, url.1
                    ))
                    .await;

                    return Ok(());
                };

                let suffix = memento_url[position + old_compact.len()..].to_owned();

                memento_url = format!("{}{}{}", source.memento_url, new_compact, suffix);
                timestamp = new_timestamp;

                continue;
            }

            // fresh parse state for the archived body
            self.cache.reset();

            self.db
                .save_archived_content(
                    &self.ns,
                    url.0,
                    &source.name,
                    &timestamp,
                    code,
                    &content_type,
                    &content,
                )
                .await?;

            let links = self.extract_archived_urls(&url.1, &content);

            self.insert_urls(&links).await?;
            self.flush_warnings(&memento_url).await;

            return Ok(());
        }

        Ok(())
    }

    /// Fetch through the archive client with one reset-and-retry. Returns
    /// the body, status code and content type, or `None` when the fetch
    /// failed permanently for this tick.
    async fn fetch_archive(&mut self, fetch_url: &str) -> Option<(String, u16, String)> {
        let mut attempts = 0;

        loop {
            let client = self.archive_client.as_mut()?;

            match client.fetch(fetch_url, false).await {
                Ok(content) => {
                    let code = client.response_code();
                    let content_type = client.content_type().to_owned();

                    self.idle_accum += client.last_rate_sleep();

                    return Some((content, code, content_type));
                }
                Err(FetchError::Skip(reason)) => {
                    self.log(&format!("{reason} - skips... [{fetch_url}]")).await;

                    return None;
                }
                Err(FetchError::Retry(reason)) => {
                    attempts += 1;

                    if attempts > 1 || !self.config.retry_archive {
                        self.log(&format!("{reason} - skips... [{fetch_url}]")).await;

                        return None;
                    }

                    self.log(&format!("{reason} [{fetch_url}]")).await;
                    self.log("resets archive connection...").await;

                    if let Some(client) = self.archive_client.as_mut() {
                        client.reset_connection().await;
                    }
                }
            }
        }
    }

    /// Relaxed link extraction for archived pages: only absolute `http(s)`
    /// URLs embedded behind the archive's own path prefix are kept,
    /// unescaped once, then resolved like any discovered link.
    pub(crate) fn extract_archived_urls(&mut self, base_url: &str, content: &str) -> Vec<String> {
        if self.resolver.set_current_url(base_url).is_err() {
            return Vec::new();
        }

        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();

        let queries = std::mem::take(&mut self.queries.links);

        for query in &queries {
            if !query.props.result_multi {
                continue;
            }

            for link in crate::query::QueryRunner::get_all(query, content, &mut self.cache) {
                let Some(embedded) = embedded_absolute_url(&link) else {
                    continue;
                };

                if let Ok(Some(resolved)) = self.resolver.resolve(&embedded)
                    && seen.insert(resolved.clone())
                {
                    results.push(resolved);
                }
            }
        }

        self.queries.links = queries;

        results
    }
}

/// Extract the absolute `http(s)` URL embedded behind an archive path
/// prefix, percent-decoded once. Links that are not archive-prefixed
/// rewrites yield nothing.
pub fn embedded_absolute_url(link: &str) -> Option<String> {
    if link.len() < 2 {
        return None;
    }

    if let Some(embedded) = find_embedded_scheme(link) {
        return Some(
            urlencoding::decode(embedded)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| embedded.to_owned()),
        );
    }

    // the embedded URL may be percent-encoded as a whole
    let decoded = urlencoding::decode(link).ok()?.into_owned();

    find_embedded_scheme(&decoded).map(str::to_owned)
}

/// Position of an `http(s)://` scheme strictly after the start of the link.
fn find_embedded_scheme(link: &str) -> Option<&str> {
    let http = link[1..].find("http://").map(|p| p + 1);
    let https = link[1..].find("https://").map(|p| p + 1);

    let position = match (http, https) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    Some(&link[position..])
}

/// Parse an `application/link-format` timemap into mementos.
///
/// Returns the parsed mementos, the URL of the next timemap page (from a
/// `rel="timemap"` entry), and any parsing warnings. Mementos with missing
/// or unparseable datetimes are dropped with a warning.
pub fn parse_mementos(content: &str) -> (Vec<Memento>, Option<String>, Vec<String>) {
    let mut mementos = Vec::new();
    let mut warnings = Vec::new();
    let mut next_page = None;

    let bytes = content.as_bytes();
    let mut pos = 0usize;

    let mut current_url = String::new();
    let mut current_timestamp = String::new();
    let mut started = false;
    let mut new_field = true;

    fn finish(url: &mut String, timestamp: &mut String, mementos: &mut Vec<Memento>) {
        if !url.is_empty() && !timestamp.is_empty() {
            mementos.push(Memento {
                url: std::mem::take(url),
                timestamp: std::mem::take(timestamp),
            });
        } else {
            url.clear();
            timestamp.clear();
        }
    }

    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\r' | b'\n' | b'\t' => {
                pos += 1;
            }
            b'<' => {
                let Some(end) = content[pos + 1..].find('>').map(|e| pos + 1 + e) else {
                    warnings.push(format!("no '>' after '<' for link at {pos}"));

                    break;
                };

                if started {
                    warnings.push(format!(
                        "new memento started without finishing the old one at {pos}"
                    ));

                    finish(&mut current_url, &mut current_timestamp, &mut mementos);
                }

                started = true;
                current_url = content[pos + 1..end].to_owned();
                current_timestamp.clear();
                pos = end + 1;
            }
            b';' => {
                new_field = true;
                pos += 1;
            }
            b',' => {
                if started {
                    finish(&mut current_url, &mut current_timestamp, &mut mementos);

                    started = false;
                }

                pos += 1;
            }
            _ => {
                if new_field {
                    new_field = false;
                } else {
                    warnings.push(format!("field separator missing for new field at {pos}"));
                }

                let Some(equals) = content[pos..].find('=').map(|e| pos + e) else {
                    // a bare field without a value: skip to the next
                    // separator
                    match content[pos..].find([',', ';']).map(|e| pos + e) {
                        Some(separator) => {
                            pos = separator;

                            continue;
                        }
                        None => {
                            warnings.push(format!("cannot find end of field at {pos}"));

                            break;
                        }
                    }
                };

                let field_name = content[pos..equals].trim().to_owned();

                let Some(quote_start) = content[equals + 1..]
                    .find(['"', '\''])
                    .map(|q| equals + 1 + q)
                else {
                    warnings.push(format!("cannot find begin of value at {pos}"));

                    pos = equals + 1;

                    continue;
                };

                let Some(quote_end) = content[quote_start + 1..]
                    .find(['"', '\''])
                    .map(|q| quote_start + 1 + q)
                else {
                    warnings.push(format!("cannot find end of value at {quote_start}"));

                    break;
                };

                let field_value = &content[quote_start + 1..quote_end];

                match field_name.as_str() {
                    "datetime" => match long_date_to_sql(field_value) {
                        Some(timestamp) => current_timestamp = timestamp,
                        None => warnings.push(format!(
                            "could not convert timestamp {field_value:?} at {pos}"
                        )),
                    },
                    "rel" => {
                        if field_value == "timemap" && !current_url.is_empty() {
                            next_page = Some(std::mem::take(&mut current_url));
                            started = false;
                        }
                    }
                    _ => {}
                }

                pos = quote_end + 1;
            }
        }
    }

    if started {
        finish(&mut current_url, &mut current_timestamp, &mut mementos);
    }

    (mementos, next_page, warnings)
}
