//! The extractor module.
//!
//! For each crawled URL, the extractor resolves per-variable source values,
//! resolves global and page-specific tokens, iterates paging until the
//! configured continuation predicate says stop, and emits structured result
//! rows into its target table.

pub mod variables;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ExtractorConfig, FieldConfig};
use crate::db::urls::ModuleFlag;
use crate::db::{Database, DbValue, TargetField, UrlLockCoordinator};
use crate::net::{FetchError, HttpClient};
use crate::parse::ParserCache;
use crate::query::{CompiledQuery, QueryProperties, QueryRunner};
use crate::supervisor::{ControlState, TickOutcome, WorkerContext, WorkerError, WorkerModule};

pub const MODULE_NAME: &str = "extractor";

pub type IdString = (i64, String);

/// Compiled queries of an extractor run.
pub struct ExtractorQueries {
    /// Variable-extraction queries, keyed by variable name.
    pub variables: HashMap<String, CompiledQuery>,
    /// Token queries by token name.
    pub tokens: HashMap<String, CompiledQuery>,
    pub ids: Vec<CompiledQuery>,
    /// Datetime queries with their format and locale.
    pub datetimes: Vec<(CompiledQuery, String, String)>,
    pub fields: Vec<(FieldConfig, CompiledQuery)>,
    pub paging_is_next: Option<CompiledQuery>,
    pub paging_next: Option<CompiledQuery>,
    pub paging_number: Option<CompiledQuery>,
}

/// One extracted dataset: a row for the target table.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub url_id: i64,
    pub extracted_id: String,
    pub datetime: String,
    pub fields: Vec<String>,
}

pub struct ExtractorWorker {
    pub(crate) db: Database,
    pub(crate) state: Arc<ControlState>,
    pub(crate) ns: String,
    pub(crate) config: ExtractorConfig,
    pub(crate) locks: UrlLockCoordinator,
    pub(crate) client: HttpClient,
    pub(crate) cache: ParserCache,
    pub(crate) queries: ExtractorQueries,

    /// Pre-fetched URL batch, locked under one shared lease.
    pub(crate) urls: VecDeque<IdString>,
    pub(crate) batch_lease: String,
    /// URLs processed successfully, with the lease valid at finish time.
    pub(crate) finished: Vec<(i64, String)>,
    pub(crate) results: Vec<Dataset>,
    pub(crate) target_table: String,

    pub(crate) idle_accum: Duration,
}

impl ExtractorWorker {
    pub fn new(
        context: WorkerContext,
        ns: String,
        config: ExtractorConfig,
        query_props: HashMap<i64, QueryProperties>,
    ) -> Result<Self, WorkerError> {
        let locks = UrlLockCoordinator::new(context.db.clone(), &ns)?;

        let client = HttpClient::new(config.network.clone())
            .map_err(|e| WorkerError::Config(e.to_string()))?;

        let queries = compile_queries(&config, &query_props)?;

        crate::db::check_identifier(&config.target_table)
            .map_err(|e| WorkerError::Config(e.to_string()))?;

        let target_table = format!("{ns}_extracted_{}", config.target_table);

        Ok(Self {
            db: context.db,
            state: context.state,
            ns,
            config,
            locks,
            client,
            cache: ParserCache::new(),
            queries,
            urls: VecDeque::new(),
            batch_lease: String::new(),
            finished: Vec::new(),
            results: Vec::new(),
            target_table,
            idle_accum: Duration::ZERO,
        })
    }

    pub(crate) async fn log(&self, entry: &str) {
        tracing::debug!(target: "siteharvest::extractor", "{entry}");

        let _ = self.db.add_log(MODULE_NAME, entry).await;
    }

    pub(crate) async fn flush_warnings(&mut self, url: &str) {
        for warning in self.cache.drain_warnings() {
            let entry = format!("WARNING: {warning} [{url}]");

            tracing::warn!(target: "siteharvest::extractor", "{entry}");

            let _ = self.db.add_log(MODULE_NAME, &entry).await;
        }
    }

    /// Fill the URL cache: the next unextracted URLs after the cursor,
    /// locked under one shared lease. Contended rows are dropped from the
    /// batch.
    async fn fill_url_cache(&mut self) -> Result<(), WorkerError> {
        let batch = self
            .db
            .next_urls_for(
                &self.ns,
                ModuleFlag::Extracted,
                self.state.last_url_id(),
                self.config.cache_size,
            )
            .await?;

        if batch.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();

        let (lease, locked) = self
            .locks
            .lock_urls_if_ok(&ids, self.config.lock_secs)
            .await?;

        self.batch_lease = lease;
        self.urls = batch
            .into_iter()
            .filter(|(id, _)| locked.contains(id))
            .collect();

        Ok(())
    }

    /// Commit the result batch: write rows (deduplicated by extracted id),
    /// update the target timestamp, and mark every processed URL finished
    /// whose lock is still valid.
    pub(crate) async fn save_results(&mut self) -> Result<(), WorkerError> {
        if !self.results.is_empty() {
            let mut seen = std::collections::HashSet::new();
            let results = std::mem::take(&mut self.results);
            let mut written = 0u64;

            for dataset in results {
                // duplicate extracted ids keep the first dataset
                if !seen.insert(dataset.extracted_id.clone()) {
                    continue;
                }

                let mut row: Vec<(String, DbValue)> = vec![
                    ("url_id".to_owned(), DbValue::Int(dataset.url_id)),
                    (
                        "extracted_id".to_owned(),
                        DbValue::Text(dataset.extracted_id),
                    ),
                    (
                        "extracted_datetime".to_owned(),
                        if dataset.datetime.is_empty() {
                            DbValue::Null
                        } else {
                            DbValue::Text(dataset.datetime)
                        },
                    ),
                ];

                for (config, value) in self.config.fields.iter().zip(dataset.fields) {
                    row.push((format!("extracted__{}", config.name), DbValue::Text(value)));
                }

                self.db.insert_target_row(&self.target_table, &row).await?;

                written += 1;
            }

            if written > 0 {
                self.db
                    .touch_target(&self.ns, &self.target_table)
                    .await?;
            }
        }

        for (url_id, lease) in std::mem::take(&mut self.finished) {
            let marked = self
                .locks
                .set_finished_if_ok(url_id, &lease, ModuleFlag::Extracted)
                .await?;

            if !marked {
                self.log(&format!(
                    "could not mark URL #{url_id} extracted, lock expired"
                ))
                .await;
            }
        }

        Ok(())
    }
}

impl WorkerModule for ExtractorWorker {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.config.sleep_idle_ms)
    }

    async fn init(&mut self, _resumed: bool) -> Result<(), WorkerError> {
        self.locks.sweep_duplicate_locks().await?;

        let mut fields = vec![
            TargetField::new("url_id", "INTEGER"),
            TargetField::new("extracted_id", "TEXT"),
            TargetField::new("extracted_datetime", "TEXT"),
        ];

        for field in &self.config.fields {
            crate::db::check_identifier(&field.name)
                .map_err(|e| WorkerError::Config(e.to_string()))?;

            fields.push(TargetField::new(format!("extracted__{}", field.name), "TEXT"));
        }

        self.db
            .init_target_table(&self.ns, &self.target_table, &fields)
            .await?;

        Ok(())
    }

    async fn tick(&mut self) -> Result<TickOutcome, WorkerError> {
        self.cache.reset();
        self.idle_accum = Duration::ZERO;

        // a warp discards the cached batch after saving pending results
        if self.state.take_warp().is_some() {
            self.save_results().await?;

            let ids: Vec<i64> = self.urls.iter().map(|(id, _)| *id).collect();

            self.locks
                .unlock_many_if_ok(&ids, &self.batch_lease)
                .await?;

            self.urls.clear();
            self.batch_lease.clear();
        }

        if self.urls.is_empty() {
            self.fill_url_cache().await?;
        }

        if self.urls.is_empty() {
            self.save_results().await?;

            self.state
                .set_status("IDLE Waiting for new URLs to extract.");
            self.state.set_progress(1.0);

            return Ok(TickOutcome::Idle);
        }

        let url = self.urls[0].clone();

        if self.config.verbose {
            self.log(&format!("extracts data for {}...", url.1)).await;
        }

        // renew the shared lease for this URL; the renewed lease is
        // per-URL from here on
        let lock_time = self
            .locks
            .renew_if_ok(url.0, &self.batch_lease, self.config.lock_secs)
            .await?;

        match lock_time {
            None => {
                if self.config.verbose {
                    self.log(&format!("skips (locked) {}", url.1)).await;
                }
            }
            Some(lock_time) => {
                self.state.set_status(&url.1);

                if let Ok(total) = self.db.url_count(&self.ns).await
                    && total > 0
                    && let Ok(position) = self.db.url_position(&self.ns, url.0).await
                {
                    self.state.set_progress(position as f32 / total as f32);
                }

                let extracted = self.extract_next(&url).await?;

                if extracted > 0 {
                    self.finished.push((url.0, lock_time));
                } else {
                    self.locks.unlock_if_ok(url.0, &lock_time).await?;
                }

                if self.config.verbose {
                    let what = match extracted {
                        0 => "skipped".to_owned(),
                        1 => "extracted one dataset from".to_owned(),
                        n => format!("extracted {n} datasets from"),
                    };

                    self.log(&format!("{what} {}", url.1)).await;
                }
            }
        }

        self.flush_warnings(&url.1).await;

        // URL finished: advance the cursor and commit at batch end
        self.urls.pop_front();
        self.state.set_last_url_id(url.0);

        if self.urls.is_empty() {
            self.save_results().await?;

            self.batch_lease.clear();
        }

        Ok(TickOutcome::Worked)
    }

    async fn on_clear(&mut self, _interrupted: bool) {
        // commit pending results and release the remaining batch
        if let Err(error) = self.save_results().await {
            tracing::error!(%error, "could not save extraction results on shutdown");
        }

        let ids: Vec<i64> = self.urls.iter().map(|(id, _)| *id).collect();

        let _ = self
            .locks
            .unlock_many_if_ok(&ids, &self.batch_lease)
            .await;

        self.urls.clear();
    }

    fn take_idle(&mut self) -> Duration {
        std::mem::take(&mut self.idle_accum)
    }
}

impl ExtractorWorker {
    /// Extract all datasets for one URL, iterating pages. Returns the
    /// number of datasets appended to the result batch.
    async fn extract_next(&mut self, url: &IdString) -> Result<u64, WorkerError> {
        let Some((_content_id, content)) = self.db.latest_content(&self.ns, url.0).await?
        else {
            if self.config.verbose {
                self.log(&format!("no content for {} - skips...", url.1)).await;
            }

            return Ok(0);
        };

        let mut variables = self.resolve_variables(url, &content).await?;

        self.resolve_global_tokens(&mut variables).await;

        let mut extracted = 0u64;
        let mut page_first = true;
        let mut page_number = self.config.paging_first;
        let mut page_name = self.config.paging_first_string.clone();

        while self.state.is_running() {
            let page = if page_name.is_empty() {
                page_number.to_string()
            } else {
                page_name.clone()
            };

            let page_alias = if self.config.paging_alias_add != 0 {
                match page.parse::<i64>() {
                    Ok(value) => (value + self.config.paging_alias_add).to_string(),
                    Err(_) => {
                        self.log(&format!(
                            "WARNING: could not create numeric alias {:?} \
                             for non-numeric paging value {page:?}",
                            self.config.paging_alias
                        ))
                        .await;

                        page.clone()
                    }
                }
            } else {
                page.clone()
            };

            let page_tokens = self.resolve_page_tokens(&page, &variables).await;

            let mut cookies = self.config.cookies.clone();
            let mut source_url = if page_first {
                page_first = false;

                if self.config.source_url_first.is_empty() {
                    self.config.source_url.clone()
                } else {
                    self.config.source_url_first.clone()
                }
            } else {
                self.config.source_url.clone()
            };

            for target in [&mut cookies, &mut source_url] {
                if !self.config.paging_variable.is_empty() {
                    *target = target.replace(&self.config.paging_variable, &page);
                }

                if !self.config.paging_alias.is_empty() {
                    *target = target.replace(&self.config.paging_alias, &page_alias);
                }

                for (name, value) in variables.iter().chain(page_tokens.iter()) {
                    *target = target.replace(name, value);
                }
            }

            if source_url.is_empty() {
                break;
            }

            let Some(page_content) = self.fetch_page(&source_url, &cookies).await else {
                break;
            };

            if page_content.is_empty() {
                break;
            }

            // fresh parse state for every page
            self.cache.reset();

            if self.extract_page(url, &source_url, &page_content).await {
                extracted += 1;
            }

            // continuation predicate
            if let Some(query) = &self.queries.paging_is_next {
                if QueryRunner::get_bool(query, &page_content, &mut self.cache) {
                    page_number += self.config.paging_step;
                    page_name.clear();
                } else {
                    break;
                }
            } else if let Some(query) = &self.queries.paging_next {
                let next = QueryRunner::get_first(query, &page_content, &mut self.cache);

                if next.is_empty() || next == page {
                    break;
                }

                page_name = next;
            } else if let Some(query) = &self.queries.paging_number {
                let raw = QueryRunner::get_first(query, &page_content, &mut self.cache);

                match raw.trim().parse::<i64>() {
                    Ok(next) if next > page_number => {
                        page_number = next;
                        page_name.clear();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        Ok(extracted)
    }

    /// Fetch one page of the source URL with the substituted cookie string.
    async fn fetch_page(&mut self, source_url: &str, cookies: &str) -> Option<String> {
        let fetch_url = format!("{}://{source_url}", self.config.network.scheme());

        let cookies = (!cookies.is_empty()).then_some(cookies);

        match self
            .client
            .fetch_with_cookies(&fetch_url, self.config.use_post, cookies)
            .await
        {
            Ok(body) => {
                self.idle_accum += self.client.last_rate_sleep();

                let code = self.client.response_code();

                if (400..=599).contains(&code) {
                    self.log(&format!("HTTP error {code} from {source_url} - skips..."))
                        .await;

                    return None;
                }

                if code != 200 {
                    self.log(&format!(
                        "WARNING: HTTP response code {code} from {source_url}"
                    ))
                    .await;
                }

                Some(body)
            }
            Err(FetchError::Skip(reason)) => {
                self.log(&format!("{reason} - skips... [{source_url}]")).await;

                None
            }
            Err(FetchError::Retry(reason)) => {
                self.log(&format!("{reason} [{source_url}]")).await;
                self.log("resets connection...").await;

                self.client.reset_connection().await;

                None
            }
        }
    }

    /// Extract one dataset from a page: id, datetime, fields. Returns
    /// whether a dataset was appended.
    async fn extract_page(
        &mut self,
        url: &IdString,
        page_url: &str,
        content: &str,
    ) -> bool {
        // the id comes from the first query yielding a non-empty single
        // value
        let mut extracted_id = String::new();

        for index in 0..self.queries.ids.len() {
            let query = &self.queries.ids[index];

            if !query.props.result_single {
                self.cache.warn(format!(
                    "id query #{} has no single-result shape",
                    query.id
                ));

                continue;
            }

            extracted_id = QueryRunner::get_first(query, content, &mut self.cache);

            if !extracted_id.is_empty() {
                break;
            }
        }

        if extracted_id.is_empty() {
            return false;
        }

        // datetime: first query whose value both extracts and converts
        let mut datetime = String::new();

        for index in 0..self.queries.datetimes.len() {
            let (query, format, locale) = &self.queries.datetimes[index];

            if !query.props.result_single {
                self.cache.warn(format!(
                    "datetime query #{} has no single-result shape",
                    query.id
                ));

                continue;
            }

            let raw = QueryRunner::get_first(query, content, &mut self.cache);

            if raw.is_empty() {
                continue;
            }

            match crate::datetime::custom_to_sql(&raw, format, locale) {
                Some(converted) => {
                    datetime = converted;

                    break;
                }
                None => {
                    let format = format.clone();

                    self.log(&format!(
                        "ERROR: could not convert date/time {raw:?} \
                         with format {format:?} from {page_url}"
                    ))
                    .await;
                }
            }
        }

        // fields, each with its own query and result shape
        let mut fields = Vec::with_capacity(self.queries.fields.len());

        for index in 0..self.queries.fields.len() {
            let (field, query) = &self.queries.fields[index];
            let field = field.clone();

            let value = if query.props.result_single {
                let mut value = QueryRunner::get_first(query, content, &mut self.cache);

                if field.tidy_text {
                    value = collapse_whitespace(&value);
                }

                if field.warn_empty && value.is_empty() {
                    self.cache
                        .warn(format!("field {:?} is empty", field.name));
                }

                serde_json::Value::String(value).to_string()
            } else if query.props.result_bool {
                let matched = QueryRunner::get_bool(query, content, &mut self.cache);

                serde_json::json!([matched.to_string()]).to_string()
            } else {
                self.cache.warn(format!(
                    "field {:?} query has no declared result shape",
                    field.name
                ));

                String::new()
            };

            fields.push(value);
        }

        self.results.push(Dataset {
            url_id: url.0,
            extracted_id,
            datetime,
            fields,
        });

        true
    }
}

/// Collapse runs of whitespace into single spaces and trim.
pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compile_queries(
    config: &ExtractorConfig,
    props: &HashMap<i64, QueryProperties>,
) -> Result<ExtractorQueries, WorkerError> {
    let compile_one = |id: i64| -> Result<CompiledQuery, WorkerError> {
        let definition = props
            .get(&id)
            .ok_or_else(|| WorkerError::Config(format!("unknown query #{id}")))?;

        Ok(CompiledQuery::compile(id, definition.clone())?)
    };

    Ok(ExtractorQueries {
        variables: config
            .variables
            .iter()
            .filter_map(|variable| {
                variable
                    .query
                    .map(|id| Ok((variable.name.clone(), compile_one(id)?)))
            })
            .collect::<Result<_, WorkerError>>()?,
        tokens: config
            .tokens
            .iter()
            .map(|token| Ok((token.name.clone(), compile_one(token.query)?)))
            .collect::<Result<_, WorkerError>>()?,
        ids: config
            .id_queries
            .iter()
            .map(|&id| compile_one(id))
            .collect::<Result<_, _>>()?,
        datetimes: config
            .datetime_queries
            .iter()
            .map(|dt| Ok((compile_one(dt.query)?, dt.format.clone(), dt.locale.clone())))
            .collect::<Result<_, WorkerError>>()?,
        fields: config
            .fields
            .iter()
            .map(|field| Ok((field.clone(), compile_one(field.query)?)))
            .collect::<Result<_, WorkerError>>()?,
        paging_is_next: config.paging_is_next_query.map(compile_one).transpose()?,
        paging_next: config.paging_next_query.map(compile_one).transpose()?,
        paging_number: config.paging_number_query.map(compile_one).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_collapses_to_single_spaces() {
        assert_eq!(collapse_whitespace("  a \n\t b  c "), "a b c");
        assert_eq!(collapse_whitespace(""), "");
    }
}
