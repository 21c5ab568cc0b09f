//! The crawler module.
//!
//! Per tick: select the next URL under a distributed lock, fetch it, run it
//! through the URL / content-type / content filter pipelines, store the
//! content blob, extract and insert discovered links, optionally walk the
//! configured Memento archives, and mark the URL finished.

pub mod archive;
pub mod filters;
pub mod links;
pub mod selection;
pub mod tokens;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CrawlerConfig;
use crate::db::urls::ModuleFlag;
use crate::db::{Database, UrlLockCoordinator};
use crate::net::{FetchError, HttpClient};
use crate::parse::ParserCache;
use crate::query::{CompiledQuery, QueryProperties, QueryRunner, QueryType};
use crate::supervisor::{ControlState, TickOutcome, WorkerContext, WorkerError, WorkerModule};
use crate::urlparse::{ParamFilter, UrlResolver};

pub const MODULE_NAME: &str = "crawler";

/// A URL row: id plus canonical string.
pub type IdString = (i64, String);

/// Compiled queries of a crawler run, grouped by purpose.
pub struct CrawlerQueries {
    pub whitelist_url: Vec<CompiledQuery>,
    pub blacklist_url: Vec<CompiledQuery>,
    pub whitelist_type: Vec<CompiledQuery>,
    pub blacklist_type: Vec<CompiledQuery>,
    pub whitelist_content: Vec<CompiledQuery>,
    pub blacklist_content: Vec<CompiledQuery>,
    pub links: Vec<CompiledQuery>,
    pub expected: Option<CompiledQuery>,
    pub canonical: Option<CompiledQuery>,
    /// Token queries by token name.
    pub tokens: HashMap<String, CompiledQuery>,
}

pub struct CrawlerWorker {
    pub(crate) db: Database,
    pub(crate) state: Arc<ControlState>,
    pub(crate) ns: String,
    /// `None` for cross-domain websites.
    pub(crate) domain: Option<String>,
    pub(crate) config: CrawlerConfig,
    pub(crate) locks: UrlLockCoordinator,
    pub(crate) client: HttpClient,
    pub(crate) archive_client: Option<HttpClient>,
    pub(crate) cache: ParserCache,
    pub(crate) resolver: UrlResolver,
    pub(crate) queries: CrawlerQueries,

    // crawling state
    pub(crate) start_page: IdString,
    pub(crate) custom_pages: Vec<IdString>,
    pub(crate) manual_url: Option<IdString>,
    pub(crate) manual_counter: usize,
    pub(crate) start_crawled: bool,
    pub(crate) manual_off: bool,
    pub(crate) next_url: Option<IdString>,
    /// Lease of the currently-held URL lock, empty when none.
    pub(crate) lock: String,
    pub(crate) retry_counter: i64,

    pub(crate) idle_accum: Duration,
}

impl CrawlerWorker {
    /// Build a crawler from pre-loaded configuration and query definitions.
    /// Query compilation happens here; a compile error refuses to start the
    /// worker.
    pub fn new(
        context: WorkerContext,
        ns: String,
        domain: Option<String>,
        config: CrawlerConfig,
        query_props: HashMap<i64, QueryProperties>,
    ) -> Result<Self, WorkerError> {
        let locks = UrlLockCoordinator::new(context.db.clone(), &ns)?;

        let client = HttpClient::new(config.network.clone())
            .map_err(|e| WorkerError::Config(e.to_string()))?;

        let archive_client = if config.archives {
            Some(
                HttpClient::new(config.network.clone())
                    .map_err(|e| WorkerError::Config(e.to_string()))?,
            )
        } else {
            None
        };

        let params = if !config.params_whitelist.is_empty() {
            ParamFilter::Whitelist(config.params_whitelist.clone())
        } else if !config.params_blacklist.is_empty() {
            ParamFilter::Blacklist(config.params_blacklist.clone())
        } else {
            ParamFilter::None
        };

        let resolver = UrlResolver::new(domain.as_deref(), params, config.max_url_length);

        let queries = compile_queries(&config, &query_props)?;

        Ok(Self {
            db: context.db,
            state: context.state,
            ns,
            domain,
            config,
            locks,
            client,
            archive_client,
            cache: ParserCache::new(),
            resolver,
            queries,
            start_page: (0, String::new()),
            custom_pages: Vec::new(),
            manual_url: None,
            manual_counter: 0,
            start_crawled: false,
            manual_off: false,
            next_url: None,
            lock: String::new(),
            retry_counter: 0,
            idle_accum: Duration::ZERO,
        })
    }

    /// Domain prefix for archive timemap URLs: the configured domain for
    /// same-domain websites, nothing for cross-domain ones (their URLs carry
    /// the host already).
    pub(crate) fn domain_prefix(&self) -> &str {
        self.domain.as_deref().unwrap_or("")
    }

    pub(crate) async fn log(&self, entry: &str) {
        tracing::debug!(target: "siteharvest::crawler", "{entry}");

        let _ = self.db.add_log(MODULE_NAME, entry).await;
    }

    /// Flush queued parse and query warnings for the URL just processed.
    pub(crate) async fn flush_warnings(&mut self, url: &str) {
        for warning in self.cache.drain_warnings() {
            let entry = format!("WARNING: {warning} [{url}]");

            tracing::warn!(target: "siteharvest::crawler", "{entry}");

            let _ = self.db.add_log(MODULE_NAME, &entry).await;
        }
    }

    /// Mark a URL finished: set the crawled flag and release the lease.
    pub(crate) async fn crawling_success(&mut self, url: &IdString) -> Result<(), WorkerError> {
        let marked = self
            .locks
            .set_finished_if_ok(url.0, &self.lock, ModuleFlag::Crawled)
            .await?;

        if !marked {
            self.log(&format!(
                "could not mark {} finished, lock expired [{}]",
                url.1, url.0
            ))
            .await;
        }

        self.lock.clear();
        self.retry_counter = 0;

        if self
            .manual_url
            .as_ref()
            .is_some_and(|manual| manual.0 == url.0)
        {
            // manual URL done: advance the custom queue or finish the start
            // page
            if self.start_page.0 == url.0 {
                self.start_crawled = true;
            } else {
                self.manual_counter += 1;
            }

            self.manual_url = None;
        } else {
            self.state.set_last_url_id(url.0);
            self.next_url = None;
        }

        Ok(())
    }

    /// Skip a URL: release the lease (unless a retry keeps it) and advance.
    pub(crate) async fn crawling_skip(&mut self, url: &IdString, unlock: bool) {
        self.retry_counter = 0;

        if self
            .manual_url
            .as_ref()
            .is_some_and(|manual| manual.0 == url.0)
        {
            if self.start_page.0 == url.0 {
                self.start_crawled = true;
            } else {
                self.manual_counter += 1;
            }

            self.manual_url = None;
        } else {
            self.state.set_last_url_id(url.0);
            self.next_url = None;
        }

        if unlock && !self.lock.is_empty() {
            let _ = self.locks.unlock_if_ok(url.0, &self.lock).await;
        }

        self.lock.clear();
    }

    /// Keep the lease and let the supervisor re-enter the same URL. Once the
    /// configured maximum of retries is exceeded, the retry becomes a skip.
    pub(crate) async fn crawling_retry(&mut self, url: &IdString) {
        self.retry_counter += 1;

        if self.config.max_retries >= 0 && self.retry_counter > self.config.max_retries {
            self.log(&format!(
                "gave up on {} after {} retries",
                url.1, self.retry_counter
            ))
            .await;

            self.crawling_skip(url, true).await;
        }
    }

    /// Classify a fetch error: `Skip` releases the URL, `Retry` resets the
    /// connection and keeps the lease. Returns whether the tick should
    /// retry.
    pub(crate) async fn handle_fetch_error(&mut self, url: &IdString, error: FetchError) {
        match error {
            FetchError::Skip(reason) => {
                self.log(&format!("{reason} - skips... [{}]", url.1)).await;
                self.crawling_skip(url, true).await;
            }
            FetchError::Retry(reason) => {
                self.log(&format!("{reason} [{}]", url.1)).await;
                self.log("resets connection...").await;
                self.state.set_status(format!("ERROR {reason} [{}]", url.1));

                self.client.reset_connection().await;
                self.crawling_retry(url).await;
            }
        }
    }

    /// Check the HTTP status of the last response: 4xx/5xx skip the URL,
    /// other non-200 codes are warnings.
    pub(crate) async fn check_response_code(&mut self, url: &str, code: u16) -> bool {
        if (400..=599).contains(&code) {
            self.log(&format!("HTTP error {code} from {url} - skips...")).await;

            return false;
        }

        if code != 200 {
            self.log(&format!("WARNING: HTTP response code {code} from {url}"))
                .await;
        }

        true
    }
}

impl WorkerModule for CrawlerWorker {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.config.sleep_idle_ms)
    }

    async fn init(&mut self, resumed: bool) -> Result<(), WorkerError> {
        self.locks.sweep_duplicate_locks().await?;

        self.init_custom_urls().await?;

        if resumed && self.state.last_url_id() > 0 {
            // resuming mid-list: the manual phase is already over
            self.manual_off = true;
        }

        Ok(())
    }

    async fn tick(&mut self) -> Result<TickOutcome, WorkerError> {
        self.cache.reset();
        self.idle_accum = Duration::ZERO;

        // a warp repositioned the cursor: drop the held URL and the retry
        // state
        if self.state.take_warp().is_some() {
            if !self.lock.is_empty() {
                let held = self.manual_url.as_ref().or(self.next_url.as_ref()).cloned();

                if let Some((id, _)) = held {
                    let _ = self.locks.unlock_if_ok(id, &self.lock).await;
                }

                self.lock.clear();
            }

            self.manual_url = None;
            self.next_url = None;
            self.retry_counter = 0;
        }

        let Some((url, use_post)) = self.select_url().await? else {
            self.state.set_status("IDLE Waiting for new URLs to crawl.");
            self.state.set_progress(1.0);

            return Ok(TickOutcome::Idle);
        };

        self.state.set_status(&url.1);

        if let Ok(total) = self.db.url_count(&self.ns).await
            && total > 0
            && let Ok(position) = self.db.url_position(&self.ns, url.0).await
        {
            self.state.set_progress(position as f32 / total as f32);
        }

        if self.config.verbose {
            self.log(&format!("crawls {}...", url.1)).await;
        }

        let crawled = self.crawl_content(&url, use_post).await?;

        self.idle_accum += self.client.last_rate_sleep();

        self.flush_warnings(&url.1).await;

        // archives are attempted even when the live crawl failed; a failed
        // archive never invalidates the live crawl, but a lost URL lock does
        let lock_kept = self.crawl_archives(&url).await?;

        if crawled {
            if lock_kept {
                self.crawling_success(&url).await?;

                if self.config.verbose {
                    self.log(&format!("finished {}", url.1)).await;
                }
            } else {
                self.crawling_skip(&url, false).await;
            }
        }

        Ok(TickOutcome::Worked)
    }

    async fn on_clear(&mut self, _interrupted: bool) {
        // release a lease held across the stop
        if !self.lock.is_empty() {
            let held = self.manual_url.as_ref().or(self.next_url.as_ref()).cloned();

            if let Some((id, _)) = held {
                let _ = self.locks.unlock_if_ok(id, &self.lock).await;
            }

            self.lock.clear();
        }
    }

    fn take_idle(&mut self) -> Duration {
        std::mem::take(&mut self.idle_accum)
    }
}

fn compile_queries(
    config: &CrawlerConfig,
    props: &HashMap<i64, QueryProperties>,
) -> Result<CrawlerQueries, WorkerError> {
    let compile_list = |ids: &[i64]| -> Result<Vec<CompiledQuery>, WorkerError> {
        ids.iter()
            .map(|&id| compile_one(id, props))
            .collect()
    };

    let queries = CrawlerQueries {
        whitelist_url: compile_list(&config.whitelist_url_queries)?,
        blacklist_url: compile_list(&config.blacklist_url_queries)?,
        whitelist_type: compile_list(&config.whitelist_type_queries)?,
        blacklist_type: compile_list(&config.blacklist_type_queries)?,
        whitelist_content: compile_list(&config.whitelist_content_queries)?,
        blacklist_content: compile_list(&config.blacklist_content_queries)?,
        links: compile_list(&config.link_queries)?,
        expected: config
            .expected_query
            .map(|id| compile_one(id, props))
            .transpose()?,
        canonical: config
            .canonical_query
            .map(|id| compile_one(id, props))
            .transpose()?,
        tokens: config
            .tokens
            .iter()
            .map(|token| Ok((token.name.clone(), compile_one(token.query, props)?)))
            .collect::<Result<_, WorkerError>>()?,
    };

    // URL and content-type filters run on plain strings
    for query in queries
        .whitelist_url
        .iter()
        .chain(&queries.blacklist_url)
        .chain(&queries.whitelist_type)
        .chain(&queries.blacklist_type)
    {
        if query.query_type() != QueryType::RegEx {
            return Err(WorkerError::Config(format!(
                "query #{} must be a RegEx to filter URLs or content types",
                query.id
            )));
        }
    }

    if let Some(canonical) = &queries.canonical
        && canonical.query_type() != QueryType::XPath
    {
        return Err(WorkerError::Config(format!(
            "canonical query #{} must be an XPath query",
            canonical.id
        )));
    }

    Ok(queries)
}

fn compile_one(
    id: i64,
    props: &HashMap<i64, QueryProperties>,
) -> Result<CompiledQuery, WorkerError> {
    let definition = props
        .get(&id)
        .ok_or_else(|| WorkerError::Config(format!("unknown query #{id}")))?;

    Ok(CompiledQuery::compile(id, definition.clone())?)
}

/// Evaluate a white/blacklist pair: pass iff (no whitelist or any whitelist
/// query matches) and no blacklist query matches.
pub(crate) fn passes_filters(
    whitelist: &[CompiledQuery],
    blacklist: &[CompiledQuery],
    input: &str,
    cache: &mut ParserCache,
) -> bool {
    let whitelisted = whitelist.is_empty()
        || whitelist
            .iter()
            .any(|query| QueryRunner::get_bool(query, input, cache));

    if !whitelisted {
        return false;
    }

    !blacklist
        .iter()
        .any(|query| QueryRunner::get_bool(query, input, cache))
}
