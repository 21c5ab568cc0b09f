//! URL-list operations.

use sqlx::Row;

use crate::urlparse::url_hash;

use super::{Database, DbError, check_identifier};

/// How many URLs are inserted per statement during batch adds.
pub const DEFAULT_URL_CHUNK: usize = 500;

/// Per-module completion flag on a URL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFlag {
    Crawled,
    Parsed,
    Extracted,
    Analyzed,
}

impl ModuleFlag {
    pub fn column(self) -> &'static str {
        match self {
            Self::Crawled => "crawled",
            Self::Parsed => "parsed",
            Self::Extracted => "extracted",
            Self::Analyzed => "analyzed",
        }
    }
}

impl Database {
    /// Insert URLs that are not in the list yet, in chunks. Hashes are
    /// computed from the canonical URL string. Returns the number of new
    /// rows.
    pub async fn add_urls(&self, ns: &str, urls: &[String]) -> Result<u64, DbError> {
        self.add_urls_chunked(ns, urls, DEFAULT_URL_CHUNK).await
    }

    pub async fn add_urls_chunked(
        &self,
        ns: &str,
        urls: &[String],
        chunk_size: usize,
    ) -> Result<u64, DbError> {
        check_identifier(ns)?;

        if urls.is_empty() {
            return Ok(0);
        }

        let mut added = 0;

        for chunk in urls.chunks(chunk_size.max(1)) {
            let placeholders = vec!["(?, ?)"; chunk.len()].join(", ");
            let statement = format!(
                "INSERT OR IGNORE INTO {ns}_urls (url, hash) VALUES {placeholders}"
            );

            let mut query = sqlx::query(&statement);

            for url in chunk {
                query = query.bind(url).bind(url_hash(url));
            }

            added += query.execute(self.pool()).await?.rows_affected();
        }

        Ok(added)
    }

    /// Id of a URL string, if present.
    pub async fn url_id(&self, ns: &str, url: &str) -> Result<Option<i64>, DbError> {
        check_identifier(ns)?;

        let row: Option<(i64,)> =
            sqlx::query_as(&format!("SELECT id FROM {ns}_urls WHERE url = ?"))
                .bind(url)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(id,)| id))
    }

    /// URL string by id.
    pub async fn url_string(&self, ns: &str, id: i64) -> Result<Option<String>, DbError> {
        check_identifier(ns)?;

        let row: Option<(String,)> =
            sqlx::query_as(&format!("SELECT url FROM {ns}_urls WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(url,)| url))
    }

    /// Next URL not yet processed by the module, with id strictly greater
    /// than `after`, in ascending id order.
    pub async fn next_url_for(
        &self,
        ns: &str,
        flag: ModuleFlag,
        after: i64,
    ) -> Result<Option<(i64, String)>, DbError> {
        Ok(self.next_urls_for(ns, flag, after, 1).await?.pop())
    }

    /// Batch variant of [`Self::next_url_for`].
    pub async fn next_urls_for(
        &self,
        ns: &str,
        flag: ModuleFlag,
        after: i64,
        limit: i64,
    ) -> Result<Vec<(i64, String)>, DbError> {
        check_identifier(ns)?;

        // modules other than the crawler only see already-crawled URLs
        let crawled = match flag {
            ModuleFlag::Crawled => "",
            _ => "AND crawled = 1",
        };

        let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
            "SELECT id, url FROM {ns}_urls \
             WHERE id > ? AND {flag} = 0 {crawled} ORDER BY id LIMIT ?",
            flag = flag.column(),
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Whether the module flag is set on a URL.
    pub async fn is_url_flagged(
        &self,
        ns: &str,
        id: i64,
        flag: ModuleFlag,
    ) -> Result<bool, DbError> {
        check_identifier(ns)?;

        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT {flag} FROM {ns}_urls WHERE id = ?",
            flag = flag.column(),
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_some_and(|(value,)| value != 0))
    }

    /// Set a module flag on a batch of URLs (used by analyzers, which work
    /// on whole corpora rather than URL by URL).
    pub async fn set_flag_for_urls(
        &self,
        ns: &str,
        flag: ModuleFlag,
        ids: &[i64],
    ) -> Result<u64, DbError> {
        check_identifier(ns)?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut updated = 0;

        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");

            let sql = format!(
                "UPDATE {ns}_urls SET {flag} = 1 WHERE id IN ({placeholders})",
                flag = flag.column(),
            );
            let mut query = sqlx::query(&sql);

            for &id in chunk {
                query = query.bind(id);
            }

            updated += query.execute(self.pool()).await?.rows_affected();
        }

        Ok(updated)
    }

    /// Reset a module flag on every URL of a list (reset command).
    pub async fn reset_flag(&self, ns: &str, flag: ModuleFlag) -> Result<u64, DbError> {
        check_identifier(ns)?;

        let result = sqlx::query(&format!(
            "UPDATE {ns}_urls SET {flag} = 0 WHERE {flag} = 1",
            flag = flag.column(),
        ))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of URLs in a list.
    pub async fn url_count(&self, ns: &str) -> Result<i64, DbError> {
        check_identifier(ns)?;

        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {ns}_urls"))
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }

    /// Position of a URL id within its list (1-based), for progress
    /// approximation.
    pub async fn url_position(&self, ns: &str, id: i64) -> Result<i64, DbError> {
        check_identifier(ns)?;

        let row: (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {ns}_urls WHERE id <= ?"))
                .bind(id)
                .fetch_one(self.pool())
                .await?;

        Ok(row.0)
    }

    /// All URLs of a list in id order (used by export and corpus assembly).
    pub async fn all_urls(&self, ns: &str) -> Result<Vec<(i64, String)>, DbError> {
        check_identifier(ns)?;

        Ok(
            sqlx::query_as(&format!("SELECT id, url FROM {ns}_urls ORDER BY id"))
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Hashes shared by more than one URL (duplicate-hash check).
    pub async fn duplicate_hashes(&self, ns: &str) -> Result<Vec<(String, i64)>, DbError> {
        check_identifier(ns)?;

        Ok(sqlx::query_as(&format!(
            "SELECT hash, COUNT(*) AS n FROM {ns}_urls GROUP BY hash HAVING n > 1"
        ))
        .fetch_all(self.pool())
        .await?)
    }

    /// Startup sweep: recompute stale canonical-URL hashes. Returns the
    /// number of repaired rows.
    pub async fn repair_url_hashes(&self, ns: &str) -> Result<u64, DbError> {
        check_identifier(ns)?;

        let rows = sqlx::query(&format!("SELECT id, url, hash FROM {ns}_urls"))
            .fetch_all(self.pool())
            .await?;

        let mut repaired = 0;

        for row in rows {
            let id: i64 = row.get("id");
            let url: String = row.get("url");
            let hash: String = row.get("hash");
            let expected = url_hash(&url);

            if hash != expected {
                sqlx::query(&format!("UPDATE {ns}_urls SET hash = ? WHERE id = ?"))
                    .bind(&expected)
                    .bind(id)
                    .execute(self.pool())
                    .await?;

                repaired += 1;
            }
        }

        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_ns() -> Database {
        let db = Database::open_in_memory().await.unwrap();

        db.init_namespace("t_list", true).await.unwrap();

        db
    }

    #[tokio::test]
    async fn urls_are_unique_per_list() {
        let db = db_with_ns().await;

        let added = db
            .add_urls("t_list", &["/a".to_owned(), "/b".to_owned()])
            .await
            .unwrap();

        assert_eq!(added, 2);

        // re-inserting an existing URL is a no-op
        let added = db
            .add_urls("t_list", &["/b".to_owned(), "/c".to_owned()])
            .await
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(db.url_count("t_list").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn next_url_iterates_in_id_order() {
        let db = db_with_ns().await;

        db.add_urls("t_list", &["/a".to_owned(), "/b".to_owned(), "/c".to_owned()])
            .await
            .unwrap();

        let (id_a, url_a) = db
            .next_url_for("t_list", ModuleFlag::Crawled, 0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(url_a, "/a");

        let (id_b, url_b) = db
            .next_url_for("t_list", ModuleFlag::Crawled, id_a)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(url_b, "/b");
        assert!(id_b > id_a);
    }

    #[tokio::test]
    async fn extractor_only_sees_crawled_urls() {
        let db = db_with_ns().await;

        db.add_urls("t_list", &["/a".to_owned(), "/b".to_owned()])
            .await
            .unwrap();

        assert!(
            db.next_url_for("t_list", ModuleFlag::Extracted, 0)
                .await
                .unwrap()
                .is_none()
        );

        sqlx::query("UPDATE t_list_urls SET crawled = 1 WHERE url = '/b'")
            .execute(db.pool())
            .await
            .unwrap();

        let (_, url) = db
            .next_url_for("t_list", ModuleFlag::Extracted, 0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(url, "/b");
    }

    #[tokio::test]
    async fn flag_reset_clears_processed_state() {
        let db = db_with_ns().await;

        db.add_urls("t_list", &["/a".to_owned()]).await.unwrap();

        sqlx::query("UPDATE t_list_urls SET extracted = 1")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.reset_flag("t_list", ModuleFlag::Extracted).await.unwrap(), 1);

        let id = db.url_id("t_list", "/a").await.unwrap().unwrap();

        assert!(!db.is_url_flagged("t_list", id, ModuleFlag::Extracted).await.unwrap());
    }

    #[tokio::test]
    async fn stale_hashes_are_repaired_on_sweep() {
        let db = db_with_ns().await;

        db.add_urls("t_list", &["/a".to_owned()]).await.unwrap();

        sqlx::query("UPDATE t_list_urls SET hash = 'stale'")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.repair_url_hashes("t_list").await.unwrap(), 1);
        assert_eq!(db.repair_url_hashes("t_list").await.unwrap(), 0);
    }
}
