//! Content blob storage.
//!
//! A URL may carry one live (crawled) blob plus any number of archived blobs,
//! keyed by `(url_id, archive source, memento timestamp)`. Blobs are written
//! once by the lock holder and never mutated.

use super::{Database, DbError, check_identifier};

impl Database {
    /// Save a live content blob for a URL. Returns the blob id.
    pub async fn save_content(
        &self,
        ns: &str,
        url_id: i64,
        response: u16,
        content_type: &str,
        body: &str,
    ) -> Result<i64, DbError> {
        check_identifier(ns)?;

        let result = sqlx::query(&format!(
            "INSERT INTO {ns}_content (url_id, response, content_type, body) \
             VALUES (?, ?, ?, ?)"
        ))
        .bind(url_id)
        .bind(response as i64)
        .bind(content_type)
        .bind(body)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Save an archived (Memento) blob. Inserting the same `(url, source,
    /// timestamp)` twice is a no-op; returns whether a row was written.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_archived_content(
        &self,
        ns: &str,
        url_id: i64,
        source: &str,
        archived_time: &str,
        response: u16,
        content_type: &str,
        body: &str,
    ) -> Result<bool, DbError> {
        check_identifier(ns)?;

        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {ns}_content \
             (url_id, response, content_type, body, archived_source, archived_time) \
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(url_id)
        .bind(response as i64)
        .bind(content_type)
        .bind(body)
        .bind(source)
        .bind(archived_time)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Does an archived blob exist for this URL, source and timestamp?
    pub async fn archived_content_exists(
        &self,
        ns: &str,
        url_id: i64,
        source: &str,
        archived_time: &str,
    ) -> Result<bool, DbError> {
        check_identifier(ns)?;

        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT id FROM {ns}_content \
             WHERE url_id = ? AND archived_source = ? AND archived_time = ?"
        ))
        .bind(url_id)
        .bind(source)
        .bind(archived_time)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_some())
    }

    /// Latest live (non-archived) blob of a URL.
    pub async fn latest_content(
        &self,
        ns: &str,
        url_id: i64,
    ) -> Result<Option<(i64, String)>, DbError> {
        check_identifier(ns)?;

        Ok(sqlx::query_as(&format!(
            "SELECT id, body FROM {ns}_content \
             WHERE url_id = ? AND archived_time IS NULL \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(url_id)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Number of blobs stored for a URL (live + archived).
    pub async fn content_count(&self, ns: &str, url_id: i64) -> Result<i64, DbError> {
        check_identifier(ns)?;

        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {ns}_content WHERE url_id = ?"
        ))
        .bind(url_id)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        let db = Database::open_in_memory().await.unwrap();

        db.init_namespace("content_t", true).await.unwrap();
        db.add_urls("content_t", &["/a".to_owned()]).await.unwrap();

        db
    }

    #[tokio::test]
    async fn live_and_archived_blobs_are_disjoint() {
        let db = db().await;

        db.save_content("content_t", 1, 200, "text/html", "<html>live</html>")
            .await
            .unwrap();

        assert!(
            db.save_archived_content(
                "content_t",
                1,
                "arch",
                "2020-01-01 00:00:00",
                200,
                "text/html",
                "<html>old</html>",
            )
            .await
            .unwrap()
        );

        // the archived blob never shadows the live one
        let (_, body) = db.latest_content("content_t", 1).await.unwrap().unwrap();

        assert_eq!(body, "<html>live</html>");
        assert_eq!(db.content_count("content_t", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn archived_blob_is_unique_per_timestamp_and_source() {
        let db = db().await;

        let inserted = db
            .save_archived_content(
                "content_t", 1, "arch", "2020-01-01 00:00:00", 200, "text/html", "x",
            )
            .await
            .unwrap();

        assert!(inserted);

        // same (url, source, timestamp): no second row
        let inserted = db
            .save_archived_content(
                "content_t", 1, "arch", "2020-01-01 00:00:00", 200, "text/html", "y",
            )
            .await
            .unwrap();

        assert!(!inserted);

        // a different source at the same timestamp is a separate capture
        assert!(
            db.save_archived_content(
                "content_t", 1, "other", "2020-01-01 00:00:00", 200, "text/html", "z",
            )
            .await
            .unwrap()
        );

        assert!(
            db.archived_content_exists("content_t", 1, "arch", "2020-01-01 00:00:00")
                .await
                .unwrap()
        );
        assert!(
            !db.archived_content_exists("content_t", 1, "arch", "2021-01-01 00:00:00")
                .await
                .unwrap()
        );
    }
}
