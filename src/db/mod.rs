//! SQLite data layer.
//!
//! All tables belonging to a website's URL list are namespaced by
//! `<website-namespace>_<urllist-namespace>`; module target tables carry an
//! additional suffix. Identifiers cannot be bound as SQL parameters, so
//! namespaces and column names are validated before being formatted into
//! statements.

pub mod admin;
pub mod content;
pub mod import_export;
pub mod locks;
pub mod logs;
pub mod targets;
pub mod threads;
pub mod urls;

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

pub use locks::UrlLockCoordinator;
pub use targets::{DbValue, TargetField};
pub use threads::ThreadRecord;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid identifier {0:?}: only ASCII letters, digits and underscores are allowed")]
    BadIdentifier(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// SQL schema for the shared (non-namespaced) tables.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS websites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL UNIQUE,
    domain TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS urllists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id),
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    case_sensitive INTEGER NOT NULL DEFAULT 1,
    UNIQUE(website_id, namespace)
);

CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER REFERENCES websites(id),
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    text TEXT NOT NULL,
    result_bool INTEGER NOT NULL DEFAULT 0,
    result_single INTEGER NOT NULL DEFAULT 0,
    result_multi INTEGER NOT NULL DEFAULT 0,
    result_subsets INTEGER NOT NULL DEFAULT 0,
    textonly INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER REFERENCES websites(id),
    module TEXT NOT NULL,
    name TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS threads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    module TEXT NOT NULL,
    website_id INTEGER NOT NULL,
    urllist_id INTEGER NOT NULL,
    config_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT '',
    paused INTEGER NOT NULL DEFAULT 0,
    running INTEGER NOT NULL DEFAULT 0,
    last_url_id INTEGER NOT NULL DEFAULT 0,
    progress REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS targets (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    updated TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, name)
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    module TEXT NOT NULL,
    entry TEXT NOT NULL,
    time TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Shared handle to the store. Cheap to clone; every worker gets its own
/// clone backed by the same pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and apply the shared schema.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        Self::connect(options).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .shared_cache(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };

        db.init_schema().await?;

        Ok(db)
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = Self { pool };

        db.init_schema().await?;

        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), DbError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;

        Ok(())
    }

    /// Create the per-URL-list tables for a namespace if they do not exist.
    pub async fn init_namespace(&self, ns: &str, case_sensitive: bool) -> Result<(), DbError> {
        check_identifier(ns)?;

        let collation = if case_sensitive { "" } else { " COLLATE NOCASE" };

        let statements = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ns}_urls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL{collation},
                hash TEXT NOT NULL,
                crawled INTEGER NOT NULL DEFAULT 0,
                parsed INTEGER NOT NULL DEFAULT 0,
                extracted INTEGER NOT NULL DEFAULT 0,
                analyzed INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{ns}_urls_url ON {ns}_urls(url);
            CREATE INDEX IF NOT EXISTS idx_{ns}_urls_hash ON {ns}_urls(hash);

            CREATE TABLE IF NOT EXISTS {ns}_locks (
                url_id INTEGER NOT NULL,
                lease TEXT NOT NULL,
                expires TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{ns}_locks_url ON {ns}_locks(url_id);

            CREATE TABLE IF NOT EXISTS {ns}_content (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url_id INTEGER NOT NULL,
                response INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                body TEXT NOT NULL,
                crawl_time TEXT NOT NULL DEFAULT (datetime('now')),
                archived_source TEXT,
                archived_time TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{ns}_content_url ON {ns}_content(url_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{ns}_content_archived
                ON {ns}_content(url_id, archived_source, archived_time)
                WHERE archived_time IS NOT NULL;
            "#
        );

        sqlx::query(&statements).execute(&self.pool).await?;

        Ok(())
    }

    /// Drop the per-URL-list tables of a namespace (cascaded deletion).
    pub async fn drop_namespace(&self, ns: &str) -> Result<(), DbError> {
        check_identifier(ns)?;

        for table in ["urls", "locks", "content"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {ns}_{table}"))
                .execute(&self.pool)
                .await?;
        }

        // drop target tables registered under this namespace
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM targets WHERE namespace = ?")
                .bind(ns)
                .fetch_all(&self.pool)
                .await?;

        for (name,) in names {
            sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("DELETE FROM targets WHERE namespace = ?")
            .bind(ns)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Cheap liveness probe, used by workers to detect reconnection after
    /// the offline flag has been set.
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;

        Ok(())
    }

    /// The underlying connection pool, for callers that need raw SQL access
    /// (custom reports, tests).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Does a table exist?
    pub async fn table_exists(&self, name: &str) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Column names of a table, in declaration order.
    pub(crate) async fn table_columns(&self, table: &str) -> Result<Vec<String>, DbError> {
        check_identifier(table)?;

        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect())
    }
}

/// Validate a SQL identifier before it is formatted into a statement.
pub(crate) fn check_identifier(name: &str) -> Result<(), DbError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(DbError::BadIdentifier(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_and_namespace_initialize() {
        let db = Database::open_in_memory().await.unwrap();

        db.init_namespace("example_news", true).await.unwrap();

        assert!(db.table_exists("example_news_urls").await.unwrap());
        assert!(db.table_exists("example_news_locks").await.unwrap());
        assert!(db.table_exists("example_news_content").await.unwrap());

        db.drop_namespace("example_news").await.unwrap();

        assert!(!db.table_exists("example_news_urls").await.unwrap());
    }

    #[tokio::test]
    async fn identifiers_are_validated() {
        let db = Database::open_in_memory().await.unwrap();

        assert!(db.init_namespace("ok_name2", true).await.is_ok());
        assert!(matches!(
            db.init_namespace("bad-name", true).await,
            Err(DbError::BadIdentifier(_))
        ));
        assert!(matches!(
            db.init_namespace("1leading", true).await,
            Err(DbError::BadIdentifier(_))
        ));
        assert!(matches!(
            db.init_namespace("drop table;", true).await,
            Err(DbError::BadIdentifier(_))
        ));
    }
}
