//! Thread record persistence.
//!
//! Thread records survive server restart: a record marked running resumes
//! from its saved cursor on the next bring-up instead of reprocessing
//! completed URLs.

use sqlx::Row;

use super::{Database, DbError};

/// Persisted state of one worker thread.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub id: i64,
    pub module: String,
    pub website_id: i64,
    pub urllist_id: i64,
    pub config_id: i64,
    pub status: String,
    pub paused: bool,
    pub running: bool,
    pub last_url_id: i64,
    pub progress: f64,
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ThreadRecord {
    ThreadRecord {
        id: row.get("id"),
        module: row.get("module"),
        website_id: row.get("website_id"),
        urllist_id: row.get("urllist_id"),
        config_id: row.get("config_id"),
        status: row.get("status"),
        paused: row.get::<i64, _>("paused") != 0,
        running: row.get::<i64, _>("running") != 0,
        last_url_id: row.get("last_url_id"),
        progress: row.get("progress"),
    }
}

impl Database {
    /// Create a thread record; returns its id.
    pub async fn add_thread(
        &self,
        module: &str,
        website_id: i64,
        urllist_id: i64,
        config_id: i64,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO threads (module, website_id, urllist_id, config_id, running) \
             VALUES (?, ?, ?, ?, 1)",
        )
        .bind(module)
        .bind(website_id)
        .bind(urllist_id)
        .bind(config_id)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_thread(&self, id: i64) -> Result<Option<ThreadRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.as_ref().map(record_from_row))
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM threads ORDER BY id")
            .fetch_all(self.pool())
            .await?;

        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn update_thread_status(&self, id: i64, status: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE threads SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn set_thread_paused(&self, id: i64, paused: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE threads SET paused = ? WHERE id = ?")
            .bind(paused as i64)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn set_thread_running(&self, id: i64, running: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE threads SET running = ? WHERE id = ?")
            .bind(running as i64)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Persist the worker's cursor and progress so a restart resumes where
    /// it left off.
    pub async fn save_thread_cursor(
        &self,
        id: i64,
        last_url_id: i64,
        progress: f64,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE threads SET last_url_id = ?, progress = ? WHERE id = ?")
            .bind(last_url_id)
            .bind(progress)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn delete_thread(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
