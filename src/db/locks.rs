//! Database-mediated URL locking.
//!
//! Mutual exclusion on URL rows across all workers and server restarts.
//! A lock is a lease: `(url_id, lease-id, expiry)`. Acquiring presents the
//! previous lease-id (or empty) plus the desired duration; an expired lock
//! counts as released regardless of its lease-id, so a crashed worker's
//! locks are reclaimable without a reaper.
//!
//! Lock transactions start `IMMEDIATE`: the write lock is taken at BEGIN,
//! so concurrent acquisitions serialize at the busy handler instead of
//! failing on a read-to-write upgrade.

use chrono::{NaiveDateTime, Utc};
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::Sqlite;
use uuid::Uuid;

use crate::datetime::SQL_FORMAT;

use super::urls::ModuleFlag;
use super::{Database, DbError, check_identifier};

/// Lock coordinator for one URL list.
#[derive(Clone)]
pub struct UrlLockCoordinator {
    db: Database,
    ns: String,
}

impl UrlLockCoordinator {
    pub fn new(db: Database, ns: &str) -> Result<Self, DbError> {
        check_identifier(ns)?;

        Ok(Self {
            db,
            ns: ns.to_owned(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    fn table(&self) -> String {
        format!("{}_locks", self.ns)
    }

    /// Try to lock a URL. Succeeds iff there is no live lock, the caller
    /// presents the lease of the existing lock, or the existing lock is
    /// expired. Returns the new lease on success, `None` on contention.
    pub async fn lock_if_ok(
        &self,
        url_id: i64,
        prior_lease: &str,
        duration_secs: i64,
    ) -> Result<Option<String>, DbError> {
        let table = self.table();
        let mut conn = self.begin_immediate().await?;

        let result = lock_one(&mut conn, &table, url_id, prior_lease, duration_secs).await;

        finish_tx(&mut conn, result).await
    }

    /// Renew a held lock. Same semantics as [`Self::lock_if_ok`].
    pub async fn renew_if_ok(
        &self,
        url_id: i64,
        prior_lease: &str,
        duration_secs: i64,
    ) -> Result<Option<String>, DbError> {
        self.lock_if_ok(url_id, prior_lease, duration_secs).await
    }

    /// Lock a batch of URLs under one shared lease, skipping contended rows.
    /// Returns the lease and the subset that was locked.
    pub async fn lock_urls_if_ok(
        &self,
        url_ids: &[i64],
        duration_secs: i64,
    ) -> Result<(String, Vec<i64>), DbError> {
        let table = self.table();
        let lease = Uuid::new_v4().to_string();

        let mut conn = self.begin_immediate().await?;

        let result = lock_batch(&mut conn, &table, url_ids, &lease, duration_secs).await;
        let locked = finish_tx(&mut conn, result).await?;

        Ok((lease, locked))
    }

    /// Release a lock if the caller still holds it. A mismatched lease is a
    /// no-op (another worker may already hold the URL after expiry).
    pub async fn unlock_if_ok(&self, url_id: i64, lease: &str) -> Result<bool, DbError> {
        if lease.is_empty() {
            return Ok(false);
        }

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE url_id = ? AND lease = ?",
            self.table()
        ))
        .bind(url_id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release every lock of a batch that still carries the shared lease.
    pub async fn unlock_many_if_ok(
        &self,
        url_ids: &[i64],
        lease: &str,
    ) -> Result<u64, DbError> {
        if lease.is_empty() || url_ids.is_empty() {
            return Ok(0);
        }

        let mut released = 0;

        for chunk in url_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");

            let sql = format!(
                "DELETE FROM {} WHERE lease = ? AND url_id IN ({placeholders})",
                self.table()
            );
            let mut query = sqlx::query(&sql).bind(lease);

            for &url_id in chunk {
                query = query.bind(url_id);
            }

            released += query.execute(self.db.pool()).await?.rows_affected();
        }

        Ok(released)
    }

    /// Atomically set the module's completion flag on the URL and release
    /// the caller's lock. Returns `false` (and sets nothing) if the lease is
    /// no longer valid.
    pub async fn set_finished_if_ok(
        &self,
        url_id: i64,
        lease: &str,
        flag: ModuleFlag,
    ) -> Result<bool, DbError> {
        if lease.is_empty() {
            return Ok(false);
        }

        let table = self.table();

        let mut conn = self.begin_immediate().await?;

        let result =
            finish_one(&mut conn, &self.ns, &table, url_id, lease, flag).await;

        finish_tx(&mut conn, result).await
    }

    /// Startup sweep: delete duplicate lock rows, keeping the entry with the
    /// latest expiry per URL. Returns the number of deleted rows.
    pub async fn sweep_duplicate_locks(&self) -> Result<u64, DbError> {
        let table = self.table();

        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE rowid NOT IN \
             (SELECT rowid FROM {table} l \
              WHERE l.expires = (SELECT MAX(expires) FROM {table} i WHERE i.url_id = l.url_id) \
              GROUP BY l.url_id)"
        ))
        .execute(self.db.pool())
        .await?;

        let deleted = result.rows_affected();

        if deleted > 0 {
            tracing::info!(namespace = %self.ns, deleted, "removed duplicate URL locks");
        }

        Ok(deleted)
    }

    /// Number of live (non-expired) locks, for diagnostics and tests.
    pub async fn live_lock_count(&self) -> Result<i64, DbError> {
        let now = Utc::now().naive_utc().format(SQL_FORMAT).to_string();

        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE expires > ?",
            self.table()
        ))
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.0)
    }

    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, DbError> {
        let mut conn = self.db.pool().acquire().await?;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        Ok(conn)
    }
}

/// Commit on success, roll back on error.
async fn finish_tx<T>(
    conn: &mut SqliteConnection,
    result: Result<T, DbError>,
) -> Result<T, DbError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;

            Ok(value)
        }
        Err(error) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;

            Err(error)
        }
    }
}

async fn lock_batch(
    conn: &mut SqliteConnection,
    table: &str,
    url_ids: &[i64],
    lease: &str,
    duration_secs: i64,
) -> Result<Vec<i64>, DbError> {
    let now = Utc::now().naive_utc();
    let expires = expiry(now, duration_secs);
    let mut locked = Vec::new();

    for &url_id in url_ids {
        let existing: Option<(String, String)> = sqlx::query_as(&format!(
            "SELECT lease, expires FROM {table} WHERE url_id = ?"
        ))
        .bind(url_id)
        .fetch_optional(&mut *conn)
        .await?;

        let lockable = match &existing {
            None => true,
            Some((_, expires)) => is_expired(expires, now),
        };

        if !lockable {
            continue;
        }

        write_lock(conn, table, url_id, lease, &expires).await?;

        locked.push(url_id);
    }

    Ok(locked)
}

async fn finish_one(
    conn: &mut SqliteConnection,
    ns: &str,
    table: &str,
    url_id: i64,
    lease: &str,
    flag: ModuleFlag,
) -> Result<bool, DbError> {
    let now = Utc::now().naive_utc();

    let existing: Option<(String, String)> = sqlx::query_as(&format!(
        "SELECT lease, expires FROM {table} WHERE url_id = ?"
    ))
    .bind(url_id)
    .fetch_optional(&mut *conn)
    .await?;

    let valid = existing
        .as_ref()
        .is_some_and(|(held, expires)| held == lease && !is_expired(expires, now));

    if !valid {
        return Ok(false);
    }

    sqlx::query(&format!(
        "UPDATE {ns}_urls SET {flag} = 1 WHERE id = ?",
        flag = flag.column(),
    ))
    .bind(url_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!("DELETE FROM {table} WHERE url_id = ?"))
        .bind(url_id)
        .execute(&mut *conn)
        .await?;

    Ok(true)
}

async fn lock_one(
    conn: &mut SqliteConnection,
    table: &str,
    url_id: i64,
    prior_lease: &str,
    duration_secs: i64,
) -> Result<Option<String>, DbError> {
    let now = Utc::now().naive_utc();

    let existing: Option<(String, String)> = sqlx::query_as(&format!(
        "SELECT lease, expires FROM {table} WHERE url_id = ?"
    ))
    .bind(url_id)
    .fetch_optional(&mut *conn)
    .await?;

    let lockable = match &existing {
        None => true,
        Some((lease, expires)) => {
            (!prior_lease.is_empty() && lease == prior_lease) || is_expired(expires, now)
        }
    };

    if !lockable {
        return Ok(None);
    }

    let new_lease = Uuid::new_v4().to_string();

    write_lock(conn, table, url_id, &new_lease, &expiry(now, duration_secs)).await?;

    Ok(Some(new_lease))
}

async fn write_lock(
    conn: &mut SqliteConnection,
    table: &str,
    url_id: i64,
    lease: &str,
    expires: &str,
) -> Result<(), DbError> {
    sqlx::query(&format!("DELETE FROM {table} WHERE url_id = ?"))
        .bind(url_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!(
        "INSERT INTO {table} (url_id, lease, expires) VALUES (?, ?, ?)"
    ))
    .bind(url_id)
    .bind(lease)
    .bind(expires)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn expiry(now: NaiveDateTime, duration_secs: i64) -> String {
    (now + chrono::Duration::seconds(duration_secs))
        .format(SQL_FORMAT)
        .to_string()
}

fn is_expired(expires: &str, now: NaiveDateTime) -> bool {
    NaiveDateTime::parse_from_str(expires, SQL_FORMAT)
        .map(|expiry| expiry <= now)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn coordinator() -> (Database, UrlLockCoordinator) {
        let db = Database::open_in_memory().await.unwrap();

        db.init_namespace("locks_t", true).await.unwrap();
        db.add_urls("locks_t", &["/a".to_owned(), "/b".to_owned()])
            .await
            .unwrap();

        let locks = UrlLockCoordinator::new(db.clone(), "locks_t").unwrap();

        (db, locks)
    }

    #[tokio::test]
    async fn at_most_one_live_lock_per_url() {
        let (_db, locks) = coordinator().await;

        let lease = locks.lock_if_ok(1, "", 300).await.unwrap();

        assert!(lease.is_some());

        // a second caller without the lease is refused
        assert!(locks.lock_if_ok(1, "", 300).await.unwrap().is_none());
        assert_eq!(locks.live_lock_count().await.unwrap(), 1);

        // the holder can renew with its lease
        let renewed = locks
            .renew_if_ok(1, lease.as_deref().unwrap(), 300)
            .await
            .unwrap();

        assert!(renewed.is_some());
        assert_eq!(locks.live_lock_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_locks_are_reclaimable() {
        let (_db, locks) = coordinator().await;

        // negative duration: lock born expired
        let stale = locks.lock_if_ok(1, "", -10).await.unwrap().unwrap();

        let fresh = locks.lock_if_ok(1, "", 300).await.unwrap();

        assert!(fresh.is_some());

        // the old holder's lease no longer unlocks
        assert!(!locks.unlock_if_ok(1, &stale).await.unwrap());
        assert!(
            locks
                .unlock_if_ok(1, fresh.as_deref().unwrap())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn unlock_with_wrong_lease_is_a_noop() {
        let (_db, locks) = coordinator().await;

        locks.lock_if_ok(1, "", 300).await.unwrap().unwrap();

        assert!(!locks.unlock_if_ok(1, "other-lease").await.unwrap());
        assert_eq!(locks.live_lock_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_finished_marks_url_and_releases() {
        let (db, locks) = coordinator().await;

        let lease = locks.lock_if_ok(1, "", 300).await.unwrap().unwrap();

        assert!(
            locks
                .set_finished_if_ok(1, &lease, ModuleFlag::Crawled)
                .await
                .unwrap()
        );
        assert!(db.is_url_flagged("locks_t", 1, ModuleFlag::Crawled).await.unwrap());
        assert_eq!(locks.live_lock_count().await.unwrap(), 0);

        // a stale lease does not mark anything
        assert!(
            !locks
                .set_finished_if_ok(2, &lease, ModuleFlag::Crawled)
                .await
                .unwrap()
        );
        assert!(!db.is_url_flagged("locks_t", 2, ModuleFlag::Crawled).await.unwrap());
    }

    #[tokio::test]
    async fn batch_lock_shares_one_lease() {
        let (_db, locks) = coordinator().await;

        // URL 2 is already held by someone else
        locks.lock_if_ok(2, "", 300).await.unwrap().unwrap();

        let (lease, locked) = locks.lock_urls_if_ok(&[1, 2], 300).await.unwrap();

        assert_eq!(locked, vec![1]);

        assert_eq!(locks.unlock_many_if_ok(&[1, 2], &lease).await.unwrap(), 1);
        assert_eq!(locks.live_lock_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_sweep_keeps_latest_expiry() {
        let (db, locks) = coordinator().await;

        for expires in ["2020-01-01 00:00:00", "2030-01-01 00:00:00", "2025-01-01 00:00:00"] {
            sqlx::query("INSERT INTO locks_t_locks (url_id, lease, expires) VALUES (1, ?, ?)")
                .bind(Uuid::new_v4().to_string())
                .bind(expires)
                .execute(db.pool())
                .await
                .unwrap();
        }

        assert_eq!(locks.sweep_duplicate_locks().await.unwrap(), 2);

        let (expires,): (String,) =
            sqlx::query_as("SELECT expires FROM locks_t_locks WHERE url_id = 1")
                .fetch_one(db.pool())
                .await
                .unwrap();

        assert_eq!(expires, "2030-01-01 00:00:00");
    }
}
