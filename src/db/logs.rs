//! Module log sink.
//!
//! Worker warnings and notable events accumulate here keyed by module name,
//! in addition to process-level tracing.

use super::{Database, DbError};

impl Database {
    pub async fn add_log(&self, module: &str, entry: &str) -> Result<(), DbError> {
        sqlx::query("INSERT INTO logs (module, entry) VALUES (?, ?)")
            .bind(module)
            .bind(entry)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn log_count(&self, module: &str) -> Result<i64, DbError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs WHERE module = ?")
            .bind(module)
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }

    pub async fn clear_logs(&self, module: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM logs WHERE module = ?")
            .bind(module)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Most recent log entries of a module, newest first.
    pub async fn recent_logs(&self, module: &str, limit: i64) -> Result<Vec<String>, DbError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT entry FROM logs WHERE module = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(module)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(entry,)| entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logs_are_keyed_by_module() {
        let db = Database::open_in_memory().await.unwrap();

        db.add_log("crawler", "one").await.unwrap();
        db.add_log("crawler", "two").await.unwrap();
        db.add_log("extractor", "other").await.unwrap();

        assert_eq!(db.log_count("crawler").await.unwrap(), 2);
        assert_eq!(db.recent_logs("crawler", 1).await.unwrap(), vec!["two"]);

        assert_eq!(db.clear_logs("crawler").await.unwrap(), 2);
        assert_eq!(db.log_count("extractor").await.unwrap(), 1);
    }
}
