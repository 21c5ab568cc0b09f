pub mod analyzer;
pub mod config;
pub mod crawler;
pub mod datetime;
pub mod db;
pub mod extractor;
pub mod net;
pub mod parse;
pub mod query;
pub mod server;
pub mod supervisor;
pub mod timing;
pub mod urlparse;

pub use config::{AnalyzerConfig, CrawlerConfig, ExtractorConfig};
pub use db::{Database, DbError, ThreadRecord, UrlLockCoordinator};
pub use net::{FetchError, HttpClient, NetworkConfig};
pub use parse::ParserCache;
pub use query::{CompiledQuery, Query, QueryProperties, QueryRunner, QueryType};
pub use server::{Server, ServerError};
pub use supervisor::{ControlState, TickOutcome, WorkerError, WorkerHandle, WorkerModule};
pub use urlparse::{ParamFilter, UrlResolver};

// Worker modules
pub use analyzer::AnalyzerWorker;
pub use crawler::CrawlerWorker;
pub use extractor::ExtractorWorker;
