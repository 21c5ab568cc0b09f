//! Warp ("time travel") recovery: repositioning a worker's cursor makes it
//! pick up unprocessed URLs it had jumped over.

use std::time::Duration;

use siteharvest::config::CrawlerConfig;
use siteharvest::db::Database;
use siteharvest::db::urls::ModuleFlag;
use siteharvest::net::NetworkConfig;
use siteharvest::server::Server;

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warp_back_recovers_a_skipped_url() {
    let mut http = mockito::Server::new_async().await;
    let host = http.host_with_port();

    http.mock("GET", mockito::Matcher::Regex("^/p.*$".to_owned()))
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>page</body></html>")
        .expect_at_least(1)
        .create_async()
        .await;

    let db = Database::open_in_memory().await.unwrap();

    let website = db.add_website("Example", "example", "").await.unwrap();
    let list = db.add_urllist(website, "warp", "Warp", true).await.unwrap();
    let ns = "example_warp";

    // twenty URLs; all but #12 already crawled, cursor parked at the end
    let urls: Vec<String> = (1..=20).map(|n| format!("{host}/p{n}")).collect();

    db.add_urls(ns, &urls).await.unwrap();

    let crawled: Vec<i64> = (1..=20).filter(|&id| id != 12).collect();

    db.set_flag_for_urls(ns, ModuleFlag::Crawled, &crawled)
        .await
        .unwrap();

    let config = CrawlerConfig {
        start_ignore: true,
        network: NetworkConfig {
            plain_http: true,
            timeout_secs: 5,
            ..NetworkConfig::default()
        },
        sleep_idle_ms: 50,
        ..CrawlerConfig::default()
    };

    let config_id = db
        .add_config(
            Some(website),
            "crawler",
            "test",
            &serde_json::to_string(&config).unwrap(),
        )
        .await
        .unwrap();

    let thread_id = db.add_thread("crawler", website, list, config_id).await.unwrap();

    db.save_thread_cursor(thread_id, 20, 0.9).await.unwrap();

    // the server resumes the running record with its saved cursor
    let server = Server::new(db.clone(), tokio::runtime::Handle::current())
        .await
        .unwrap();

    // with the cursor past every URL, the worker idles and #12 stays behind
    let idle = wait_for(|| async {
        server
            .thread_status(thread_id)
            .map(|(status, _)| status.starts_with("IDLE"))
            .unwrap_or(false)
    })
    .await;

    assert!(idle, "worker never went idle");
    assert!(!db.is_url_flagged(ns, 12, ModuleFlag::Crawled).await.unwrap());

    // warp back before the gap; issuing the same warp twice must be
    // harmless
    server.warp_thread(thread_id, 5).unwrap();
    server.warp_thread(thread_id, 5).unwrap();

    let recovered = wait_for(|| async {
        db.is_url_flagged(ns, 12, ModuleFlag::Crawled)
            .await
            .unwrap_or(false)
    })
    .await;

    assert!(recovered, "warp did not recover URL #12");

    server.stop_thread(thread_id).unwrap();

    wait_for(|| async { server.poll() == 0 }).await;
}
