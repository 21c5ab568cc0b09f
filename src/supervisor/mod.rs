//! Worker thread supervision.
//!
//! Each worker module runs on its own OS thread and drives its async code
//! through a runtime handle, so per-tick parser state can stay thread-local.
//! The supervisor owns the lifecycle (created, running, paused, stopping,
//! finished), the tick loop with its retry discipline, the offline probe
//! after database loss, and the final ticks-per-second accounting.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;

use crate::db::{Database, DbError, ThreadRecord};
use crate::query::QueryError;
use crate::timing::WorkerTimers;

pub use state::{ControlState, WarpJump};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("worker is not pausable")]
    NotPausable,
    #[error("worker cannot seek")]
    NotWarpable,
    #[error("worker already running")]
    AlreadyRunning,
}

/// One unit of forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A primary input was processed (or attempted).
    Worked,
    /// No input was available; the loop sleeps and accounts idle time.
    Idle,
}

/// A worker module: crawler, extractor or analyzer. Implementations are
/// constructed on the worker thread itself and need not be `Send`.
pub trait WorkerModule {
    fn name(&self) -> &'static str;

    /// Sleep between ticks when no input is available.
    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn init(
        &mut self,
        resumed: bool,
    ) -> impl std::future::Future<Output = Result<(), WorkerError>>;

    fn tick(&mut self) -> impl std::future::Future<Output = Result<TickOutcome, WorkerError>>;

    fn on_pause(&mut self) -> impl std::future::Future<Output = ()> {
        async {}
    }

    fn on_unpause(&mut self) -> impl std::future::Future<Output = ()> {
        async {}
    }

    /// Final cleanup; `interrupted` is true when the server shuts down with
    /// work left, false on a cooperative stop.
    fn on_clear(&mut self, interrupted: bool) -> impl std::future::Future<Output = ()> {
        let _ = interrupted;

        async {}
    }

    /// Time the last tick spent sleeping (e.g. on the HTTP rate limit),
    /// accounted as idle rather than working time.
    fn take_idle(&mut self) -> Duration {
        Duration::ZERO
    }
}

/// Control-plane handle to a spawned worker.
pub struct WorkerHandle {
    pub thread_id: i64,
    pub module: String,
    state: Arc<ControlState>,
    join: Option<std::thread::JoinHandle<()>>,
    pausable: bool,
    warpable: bool,
}

impl WorkerHandle {
    pub fn state(&self) -> &Arc<ControlState> {
        &self.state
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        if !self.pausable {
            return Err(ControlError::NotPausable);
        }

        self.state.set_paused(true);

        Ok(())
    }

    pub fn unpause(&self) {
        self.state.set_paused(false);
    }

    /// Request a cooperative stop; the worker observes it at the next
    /// suspension point.
    pub fn stop(&self) {
        self.state.request_stop();
    }

    /// Server shutdown: stop the worker but keep its thread record marked
    /// running so it resumes after restart.
    pub fn interrupt(&self) {
        self.state.request_interrupt();
    }

    /// Reposition the worker's cursor to a different URL id.
    pub fn warp_to(&self, url_id: i64) -> Result<(), ControlError> {
        if !self.warpable {
            return Err(ControlError::NotWarpable);
        }

        self.state.warp_to(url_id);

        Ok(())
    }

    pub fn status(&self) -> String {
        self.state.status()
    }

    pub fn progress(&self) -> f32 {
        self.state.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|join| join.is_finished())
    }

    /// Join the worker thread after a stop request.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::error!(thread_id = self.thread_id, "worker thread panicked");
        }
    }
}

/// Everything a module factory needs to build a worker.
pub struct WorkerContext {
    pub db: Database,
    pub state: Arc<ControlState>,
    pub record: ThreadRecord,
}

/// Spawn a worker thread for a thread record. The factory runs on the new
/// thread and builds the module there; `resumed` is true when the record is
/// picked up again after a server restart. `pausable` and `warpable` declare
/// which control verbs the module supports (an analyzer, for example, has no
/// URL cursor to seek).
pub fn spawn_worker<M, F>(
    runtime: Handle,
    db: Database,
    record: ThreadRecord,
    resumed: bool,
    pausable: bool,
    warpable: bool,
    factory: F,
) -> WorkerHandle
where
    M: WorkerModule + 'static,
    F: FnOnce(WorkerContext) -> Result<M, WorkerError> + Send + 'static,
{
    let state = Arc::new(ControlState::new(
        record.id,
        record.last_url_id,
        record.paused,
    ));

    let thread_state = Arc::clone(&state);
    let thread_id = record.id;
    let module_name = record.module.clone();

    let join = std::thread::Builder::new()
        .name(format!("worker-{thread_id}"))
        .spawn(move || {
            runtime.block_on(run_worker(db, thread_state, record, resumed, factory));
        })
        .expect("spawning a worker thread");

    WorkerHandle {
        thread_id,
        module: module_name,
        state,
        join: Some(join),
        pausable,
        warpable,
    }
}

async fn run_worker<M, F>(
    db: Database,
    state: Arc<ControlState>,
    record: ThreadRecord,
    resumed: bool,
    factory: F,
) where
    M: WorkerModule,
    F: FnOnce(WorkerContext) -> Result<M, WorkerError>,
{
    let thread_id = record.id;

    let context = WorkerContext {
        db: db.clone(),
        state: Arc::clone(&state),
        record,
    };

    let mut module = match factory(context) {
        Ok(module) => module,
        Err(error) => {
            fail_thread(&db, &state, "worker", &error).await;

            return;
        }
    };

    if let Err(error) = module.init(resumed).await {
        fail_thread(&db, &state, module.name(), &error).await;

        return;
    }

    let mut timers = WorkerTimers::new();
    let mut was_paused = false;

    while state.is_running() {
        if state.is_paused() {
            if !was_paused {
                module.on_pause().await;
                timers.on_pause();

                was_paused = true;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;

            continue;
        }

        if was_paused {
            module.on_unpause().await;
            timers.on_unpause();

            was_paused = false;
        }

        if state.is_offline() {
            // probe reconnection once per tick, suppressing all writes
            tokio::time::sleep(Duration::from_secs(1)).await;

            if db.ping().await.is_ok() {
                state.set_offline(false);

                tracing::info!(thread_id, "database connection re-established");
            }

            continue;
        }

        match module.tick().await {
            Ok(TickOutcome::Worked) => {
                if timers.is_idle() {
                    timers.idle_stop();
                }

                timers.add_tick();
                timers.add_idle(module.take_idle());

                persist_cursor(&db, &state).await;
            }
            Ok(TickOutcome::Idle) => {
                timers.idle_start();

                tokio::time::sleep(module.idle_sleep()).await;
            }
            Err(WorkerError::Db(error)) => {
                tracing::warn!(thread_id, %error, "database lost; going offline");

                state.set_offline(true);
            }
            Err(error) => {
                fail_thread(&db, &state, module.name(), &error).await;

                break;
            }
        }
    }

    let interrupted = state.was_interrupted();

    module.on_clear(interrupted).await;

    if timers.ticks() > 0 {
        let entry = format!("average speed: {:.2} ticks per second", timers.ticks_per_sec());

        tracing::info!(thread_id, "{entry}");

        let _ = db.add_log(module.name(), &entry).await;
    }

    persist_cursor(&db, &state).await;

    if !interrupted {
        let _ = db.set_thread_running(thread_id, false).await;
    }
}

async fn persist_cursor(db: &Database, state: &ControlState) {
    if state.is_offline() {
        return;
    }

    let _ = db
        .save_thread_cursor(
            state.thread_id(),
            state.last_url_id(),
            state.progress() as f64,
        )
        .await;

    let _ = db
        .update_thread_status(state.thread_id(), &state.status())
        .await;
}

async fn fail_thread(
    db: &Database,
    state: &ControlState,
    module: &str,
    error: &WorkerError,
) {
    let status = format!("ERROR {error}");

    tracing::error!(thread_id = state.thread_id(), module, %error, "worker failed");

    state.set_status(status.clone());
    state.request_stop();

    let _ = db.update_thread_status(state.thread_id(), &status).await;
    let _ = db.add_log(module, &status).await;
}
