//! URL-lock safety under concurrency: at most one worker holds a
//! non-expired lock on a URL at any time.

use siteharvest::db::urls::ModuleFlag;
use siteharvest::db::{Database, UrlLockCoordinator};
use tempfile::TempDir;

async fn file_backed() -> (TempDir, Database, UrlLockCoordinator) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("locks.sqlite")).await.unwrap();

    db.init_namespace("race_t", true).await.unwrap();
    db.add_urls("race_t", &["/contended".to_owned()]).await.unwrap();

    let locks = UrlLockCoordinator::new(db.clone(), "race_t").unwrap();

    (dir, db, locks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_acquisition_produces_a_single_holder() {
    let (_dir, _db, locks) = file_backed().await;

    let mut tasks = Vec::new();

    for _ in 0..16 {
        let locks = locks.clone();

        tasks.push(tokio::spawn(async move {
            locks.lock_if_ok(1, "", 300).await.unwrap()
        }));
    }

    let mut holders = 0;

    for task in tasks {
        if task.await.unwrap().is_some() {
            holders += 1;
        }
    }

    assert_eq!(holders, 1, "more than one worker won the lock");
    assert_eq!(locks.live_lock_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn expired_leases_move_between_workers_without_overlap() {
    let (_dir, _db, locks) = file_backed().await;

    // repeated rounds: the previous lease expires (negative duration), the
    // next round's winner takes over; never two live locks
    for _ in 0..10 {
        let stale = locks.lock_if_ok(1, "", -5).await.unwrap();

        assert!(stale.is_some());
        assert_eq!(locks.live_lock_count().await.unwrap(), 0);

        let mut tasks = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();

            tasks.push(tokio::spawn(async move {
                locks.lock_if_ok(1, "", 300).await.unwrap()
            }));
        }

        let mut winners = Vec::new();

        for task in tasks {
            if let Some(lease) = task.await.unwrap() {
                winners.push(lease);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(locks.live_lock_count().await.unwrap(), 1);

        // release for the next round
        assert!(locks.unlock_if_ok(1, &winners[0]).await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_urls_are_not_reprocessed() {
    let (_dir, db, locks) = file_backed().await;

    let lease = locks.lock_if_ok(1, "", 300).await.unwrap().unwrap();

    assert!(
        locks
            .set_finished_if_ok(1, &lease, ModuleFlag::Crawled)
            .await
            .unwrap()
    );

    // the crawler's queue query no longer returns the URL
    assert!(
        db.next_url_for("race_t", ModuleFlag::Crawled, 0)
            .await
            .unwrap()
            .is_none()
    );

    // a reset makes it eligible again
    db.reset_flag("race_t", ModuleFlag::Crawled).await.unwrap();

    assert!(
        db.next_url_for("race_t", ModuleFlag::Crawled, 0)
            .await
            .unwrap()
            .is_some()
    );
}
