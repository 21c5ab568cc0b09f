//! The control process.
//!
//! Owns the process-wide list of live worker handles, launches worker
//! threads for activated thread records, harvests finished workers, and
//! exposes the command verbs (start/pause/unpause/stop/warp on threads, CRUD
//! on websites / URL lists / queries / configurations, resets, import and
//! export, test-query) that an external command channel translates requests
//! into.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::analyzer::AnalyzerWorker;
use crate::config::{AnalyzerConfig, CrawlerConfig, ExtractorConfig};
use crate::crawler::CrawlerWorker;
use crate::db::import_export::{Codec, ImportExportError};
use crate::db::urls::ModuleFlag;
use crate::db::{Database, DbError, ThreadRecord};
use crate::extractor::ExtractorWorker;
use crate::parse::ParserCache;
use crate::query::{CompiledQuery, QueryError, QueryProperties, QueryRunner};
use crate::supervisor::{ControlError, WorkerHandle, spawn_worker};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    ImportExport(#[from] ImportExportError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown module {0:?}")]
    UnknownModule(String),
    #[error("no such thread #{0}")]
    NoSuchThread(i64),
}

/// Result of a test-query command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryTestResult {
    pub matched: Option<bool>,
    pub first: Option<String>,
    pub all: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

pub struct Server {
    db: Database,
    runtime: Handle,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Server {
    /// Bring up the control process: run the startup sweeps over every URL
    /// list and resume thread records still marked running.
    pub async fn new(db: Database, runtime: Handle) -> Result<Self, ServerError> {
        let server = Self {
            db,
            runtime,
            workers: Mutex::new(Vec::new()),
        };

        server.startup_sweeps().await?;
        server.resume_threads().await?;

        Ok(server)
    }

    /// Duplicate-lock sweep and URL-hash repair for every known URL list.
    async fn startup_sweeps(&self) -> Result<(), ServerError> {
        let websites = {
            let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM websites")
                .fetch_all(self.db.pool())
                .await
                .map_err(DbError::from)?;

            rows
        };

        for (website_id,) in websites {
            for list in self.db.list_urllists(website_id).await? {
                let ns = self.db.full_namespace(list.id).await?;

                let locks = crate::db::UrlLockCoordinator::new(self.db.clone(), &ns)?;

                locks.sweep_duplicate_locks().await?;

                let repaired = self.db.repair_url_hashes(&ns).await?;

                if repaired > 0 {
                    tracing::info!(namespace = %ns, repaired, "repaired stale URL hashes");
                }
            }
        }

        Ok(())
    }

    /// Resume every thread record still marked running from its saved
    /// cursor.
    async fn resume_threads(&self) -> Result<(), ServerError> {
        for record in self.db.list_threads().await? {
            if record.running {
                tracing::info!(
                    thread_id = record.id,
                    module = %record.module,
                    "resuming thread from URL #{}",
                    record.last_url_id
                );

                self.spawn_from_record(record, true).await?;
            }
        }

        Ok(())
    }

    /// Create a thread record and launch its worker.
    pub async fn start_thread(
        &self,
        module: &str,
        website_id: i64,
        urllist_id: i64,
        config_id: i64,
    ) -> Result<i64, ServerError> {
        if !matches!(module, "crawler" | "extractor" | "analyzer") {
            return Err(ServerError::UnknownModule(module.to_owned()));
        }

        let id = self
            .db
            .add_thread(module, website_id, urllist_id, config_id)
            .await?;

        let record = self
            .db
            .get_thread(id)
            .await?
            .ok_or(ServerError::NoSuchThread(id))?;

        self.spawn_from_record(record, false).await?;

        Ok(id)
    }

    /// Load everything a worker needs and spawn its thread.
    async fn spawn_from_record(
        &self,
        record: ThreadRecord,
        resumed: bool,
    ) -> Result<(), ServerError> {
        let ns = self.db.full_namespace(record.urllist_id).await?;
        let website = self
            .db
            .get_website(record.website_id)
            .await?
            .ok_or_else(|| ServerError::Config(format!("website #{}", record.website_id)))?;

        let domain = (!website.domain.is_empty()).then(|| website.domain.clone());
        let body = self.db.get_config_body(record.config_id).await?;
        let module = record.module.clone();

        let handle = match module.as_str() {
            "crawler" => {
                let config: CrawlerConfig = serde_json::from_str(&body)
                    .map_err(|e| ServerError::Config(e.to_string()))?;

                let props = self.load_query_props(&config.query_ids()).await?;

                spawn_worker(
                    self.runtime.clone(),
                    self.db.clone(),
                    record,
                    resumed,
                    true,
                    true,
                    move |context| CrawlerWorker::new(context, ns, domain, config, props),
                )
            }
            "extractor" => {
                let config: ExtractorConfig = serde_json::from_str(&body)
                    .map_err(|e| ServerError::Config(e.to_string()))?;

                let props = self.load_query_props(&config.query_ids()).await?;

                spawn_worker(
                    self.runtime.clone(),
                    self.db.clone(),
                    record,
                    resumed,
                    true,
                    true,
                    move |context| ExtractorWorker::new(context, ns, config, props),
                )
            }
            "analyzer" => {
                let config: AnalyzerConfig = serde_json::from_str(&body)
                    .map_err(|e| ServerError::Config(e.to_string()))?;

                let props = self.load_query_props(&config.query_ids()).await?;

                spawn_worker(
                    self.runtime.clone(),
                    self.db.clone(),
                    record,
                    resumed,
                    true,
                    false,
                    move |context| AnalyzerWorker::new(context, ns, config, props),
                )
            }
            other => return Err(ServerError::UnknownModule(other.to_owned())),
        };

        self.workers.lock().push(handle);

        Ok(())
    }

    async fn load_query_props(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, QueryProperties>, ServerError> {
        let mut props = HashMap::with_capacity(ids.len());

        for &id in ids {
            props.insert(id, self.db.get_query_props(id).await?);
        }

        Ok(props)
    }

    pub async fn pause_thread(&self, thread_id: i64) -> Result<(), ServerError> {
        {
            let workers = self.workers.lock();
            let worker = workers
                .iter()
                .find(|worker| worker.thread_id == thread_id)
                .ok_or(ServerError::NoSuchThread(thread_id))?;

            worker.pause()?;
        }

        self.db.set_thread_paused(thread_id, true).await?;

        Ok(())
    }

    pub async fn unpause_thread(&self, thread_id: i64) -> Result<(), ServerError> {
        {
            let workers = self.workers.lock();
            let worker = workers
                .iter()
                .find(|worker| worker.thread_id == thread_id)
                .ok_or(ServerError::NoSuchThread(thread_id))?;

            worker.unpause();
        }

        self.db.set_thread_paused(thread_id, false).await?;

        Ok(())
    }

    /// Cooperative stop; the record is marked not running once the worker
    /// exits.
    pub fn stop_thread(&self, thread_id: i64) -> Result<(), ServerError> {
        let workers = self.workers.lock();
        let worker = workers
            .iter()
            .find(|worker| worker.thread_id == thread_id)
            .ok_or(ServerError::NoSuchThread(thread_id))?;

        worker.stop();

        Ok(())
    }

    /// Reposition a worker's URL cursor ("time travel").
    pub fn warp_thread(&self, thread_id: i64, url_id: i64) -> Result<(), ServerError> {
        let workers = self.workers.lock();
        let worker = workers
            .iter()
            .find(|worker| worker.thread_id == thread_id)
            .ok_or(ServerError::NoSuchThread(thread_id))?;

        worker.warp_to(url_id)?;

        Ok(())
    }

    /// Status line of a thread: message, progress, module.
    pub fn thread_status(&self, thread_id: i64) -> Result<(String, f32), ServerError> {
        let workers = self.workers.lock();
        let worker = workers
            .iter()
            .find(|worker| worker.thread_id == thread_id)
            .ok_or(ServerError::NoSuchThread(thread_id))?;

        Ok((worker.status(), worker.progress()))
    }

    /// Harvest finished workers; returns how many are still alive.
    pub fn poll(&self) -> usize {
        let mut workers = self.workers.lock();

        workers.retain_mut(|worker| {
            if worker.is_finished() {
                worker.join();

                tracing::info!(
                    thread_id = worker.thread_id,
                    module = %worker.module,
                    "worker finished"
                );

                false
            } else {
                true
            }
        });

        workers.len()
    }

    /// Interrupt every worker (server shutdown): records stay marked running
    /// so they resume on the next bring-up.
    pub async fn shutdown(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock());

        for worker in &workers {
            worker.interrupt();
        }

        tokio::task::block_in_place(|| {
            for worker in &mut workers {
                worker.join();
            }
        });
    }

    /// Reset the parsing / extracting / analyzing status of a URL list.
    pub async fn reset_flag(
        &self,
        urllist_id: i64,
        flag: ModuleFlag,
    ) -> Result<u64, ServerError> {
        let ns = self.db.full_namespace(urllist_id).await?;

        Ok(self.db.reset_flag(&ns, flag).await?)
    }

    /// Duplicate a website with its queries and configurations.
    pub async fn duplicate_website(
        &self,
        website_id: i64,
        new_name: &str,
        new_namespace: &str,
    ) -> Result<i64, ServerError> {
        Ok(self
            .db
            .duplicate_website(website_id, new_name, new_namespace)
            .await?)
    }

    /// Duplicate a URL list with its URLs (processing flags reset).
    pub async fn duplicate_urllist(
        &self,
        urllist_id: i64,
        new_name: &str,
        new_namespace: &str,
    ) -> Result<i64, ServerError> {
        Ok(self
            .db
            .duplicate_urllist(urllist_id, new_name, new_namespace)
            .await?)
    }

    /// Duplicate a single query under a new name.
    pub async fn duplicate_query(
        &self,
        query_id: i64,
        new_name: &str,
    ) -> Result<i64, ServerError> {
        Ok(self.db.duplicate_query(query_id, new_name).await?)
    }

    /// Duplicate a single configuration under a new name.
    pub async fn duplicate_config(
        &self,
        config_id: i64,
        new_name: &str,
    ) -> Result<i64, ServerError> {
        Ok(self.db.duplicate_config(config_id, new_name).await?)
    }

    /// Export a URL list through a codec.
    pub async fn export_urllist(
        &self,
        urllist_id: i64,
        codec: Codec,
    ) -> Result<Vec<u8>, ServerError> {
        let ns = self.db.full_namespace(urllist_id).await?;

        Ok(self.db.export_url_list(&ns, codec).await?)
    }

    /// Import URLs into a list; returns the number of new URLs.
    pub async fn import_urllist(
        &self,
        urllist_id: i64,
        data: Vec<u8>,
        codec: Codec,
    ) -> Result<u64, ServerError> {
        let ns = self.db.full_namespace(urllist_id).await?;

        Ok(self.db.import_url_list(&ns, &data, codec).await?)
    }

    /// Merge one URL list into another; returns the number of new URLs.
    pub async fn merge_urllists(
        &self,
        from_urllist_id: i64,
        into_urllist_id: i64,
    ) -> Result<u64, ServerError> {
        let from_ns = self.db.full_namespace(from_urllist_id).await?;
        let into_ns = self.db.full_namespace(into_urllist_id).await?;

        Ok(self.db.merge_url_lists(&from_ns, &into_ns).await?)
    }

    /// Compile and evaluate a query against a test string, returning the
    /// declared result shapes.
    pub fn test_query(
        &self,
        props: QueryProperties,
        content: &str,
    ) -> Result<QueryTestResult, ServerError> {
        let query = CompiledQuery::compile(0, props)?;
        let mut cache = ParserCache::new();

        let matched = query
            .props
            .result_bool
            .then(|| QueryRunner::get_bool(&query, content, &mut cache));
        let first = query
            .props
            .result_single
            .then(|| QueryRunner::get_first(&query, content, &mut cache));
        let all = query
            .props
            .result_multi
            .then(|| QueryRunner::get_all(&query, content, &mut cache));

        Ok(QueryTestResult {
            matched,
            first,
            all,
            warnings: cache.drain_warnings(),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run the low-frequency control loop until a shutdown signal arrives.
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    self.poll();
                }
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("shutting down");

                        self.shutdown().await;

                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // workers observe the interrupt at their next suspension point
        for worker in self.workers.lock().iter() {
            worker.interrupt();
        }
    }
}
