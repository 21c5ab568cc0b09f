//! End-to-end crawling scenarios against a mock HTTP server.

use std::time::Duration;

use siteharvest::config::{ArchiveConfig, CrawlerConfig};
use siteharvest::db::Database;
use siteharvest::db::urls::ModuleFlag;
use siteharvest::net::NetworkConfig;
use siteharvest::query::{QueryProperties, QueryType};
use siteharvest::server::Server;

fn link_query() -> QueryProperties {
    QueryProperties {
        query_type: QueryType::XPath,
        text: "//a/@href".to_owned(),
        result_bool: false,
        result_single: false,
        result_multi: true,
        result_subsets: false,
        text_only: false,
    }
}

fn test_network() -> NetworkConfig {
    NetworkConfig {
        plain_http: true,
        timeout_secs: 5,
        ..NetworkConfig::default()
    }
}

/// Wait until the condition holds or the timeout elapses.
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
async fn start_page_crawl_discovers_and_inserts_links() {
    let mut http = mockito::Server::new_async().await;
    let host = http.host_with_port();

    http.mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/a">next</a></body></html>"#)
        .create_async()
        .await;
    http.mock("GET", "/a")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>leaf</body></html>")
        .create_async()
        .await;

    let db = Database::open_in_memory().await.unwrap();
    let server = Server::new(db.clone(), tokio::runtime::Handle::current())
        .await
        .unwrap();

    // cross-domain website: every URL carries its own host
    let website = db.add_website("Example", "example", "").await.unwrap();
    let list = db.add_urllist(website, "main", "Main", true).await.unwrap();
    let query = db.add_query(Some(website), "links", &link_query()).await.unwrap();

    let config = CrawlerConfig {
        start_page: format!("{host}/"),
        link_queries: vec![query],
        network: test_network(),
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

    let thread_id = server
        .start_thread("crawler", website, list, config_id)
        .await
        .unwrap();

    // the start page is crawled and the discovered link appears in the list
    let ns = "example_main";

    let crawled = wait_for(|| async {
        let Ok(Some(start_id)) = db.url_id(ns, &format!("{host}/")).await else {
            return false;
        };

        db.is_url_flagged(ns, start_id, ModuleFlag::Crawled)
            .await
            .unwrap_or(false)
    })
    .await;

    assert!(crawled, "start page was never marked crawled");

    let discovered = db.url_id(ns, &format!("{host}/a")).await.unwrap();

    assert!(discovered.is_some(), "discovered link missing from URL list");

    // exactly one content blob for the start page
    let start_id = db.url_id(ns, &format!("{host}/")).await.unwrap().unwrap();

    assert_eq!(db.content_count(ns, start_id).await.unwrap(), 1);

    // the discovered URL is unique (no duplicate insertion on re-crawl)
    let (status, _) = server.thread_status(thread_id).unwrap();

    assert!(!status.starts_with("ERROR"), "thread reported {status}");

    server.stop_thread(thread_id).unwrap();

    wait_for(|| async { server.poll() == 0 }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archive_redirect_capture_is_followed_and_stored() {
    let mut http = mockito::Server::new_async().await;
    let host = http.host_with_port();
    let base = http.url();

    http.mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>live</body></html>")
        .create_async()
        .await;

    // the timemap advertises one memento at 2019; fetching it redirects the
    // capture to 2020
    let timemap_path = format!("/ts/{host}/");
    let memento_2019 = format!("{base}/m/20190101000000/{host}/");

    http.mock("GET", timemap_path.as_str())
        .with_status(200)
        .with_header("content-type", "application/link-format")
        .with_body(format!(
            "<{memento_2019}>;rel=\"memento\";datetime=\"Tue, 01 Jan 2019 00:00:00 GMT\""
        ))
        .create_async()
        .await;

    http.mock("GET", format!("/m/20190101000000/{host}/").as_str())
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("found capture at 20200101000000")
        .create_async()
        .await;

    http.mock("GET", format!("/m/20200101000000/{host}/").as_str())
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>capture</body></html>")
        .create_async()
        .await;

    let db = Database::open_in_memory().await.unwrap();
    let server = Server::new(db.clone(), tokio::runtime::Handle::current())
        .await
        .unwrap();

    let website = db.add_website("Example", "example", "").await.unwrap();
    let list = db.add_urllist(website, "arch", "Arch", true).await.unwrap();

    let config = CrawlerConfig {
        start_page: format!("{host}/"),
        network: test_network(),
        sleep_idle_ms: 50,
        archives: true,
        archive_sources: vec![ArchiveConfig {
            name: "testarchive".to_owned(),
            timemap_url: format!("{base}/ts/"),
            memento_url: format!("{base}/m/"),
        }],
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

    let thread_id = server
        .start_thread("crawler", website, list, config_id)
        .await
        .unwrap();

    let ns = "example_arch";

    let archived = wait_for(|| async {
        let Ok(Some(url_id)) = db.url_id(ns, &format!("{host}/")).await else {
            return false;
        };

        db.archived_content_exists(ns, url_id, "testarchive", "2020-01-01 00:00:00")
            .await
            .unwrap_or(false)
    })
    .await;

    assert!(archived, "archived blob for the redirected capture is missing");

    // the live URL is still marked finished
    let url_id = db.url_id(ns, &format!("{host}/")).await.unwrap().unwrap();

    let finished = wait_for(|| async {
        db.is_url_flagged(ns, url_id, ModuleFlag::Crawled)
            .await
            .unwrap_or(false)
    })
    .await;

    assert!(finished);

    server.stop_thread(thread_id).unwrap();

    wait_for(|| async { server.poll() == 0 }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_discovered_url_is_inserted_twice() {
    let mut http = mockito::Server::new_async().await;
    let host = http.host_with_port();

    // every page links to the same two targets
    let body = r#"<html><body><a href="/x">x</a><a href="/x">x again</a><a href="/y">y</a></body></html>"#;

    for path in ["/", "/x", "/y"] {
        http.mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(body)
            .create_async()
            .await;
    }

    let db = Database::open_in_memory().await.unwrap();
    let server = Server::new(db.clone(), tokio::runtime::Handle::current())
        .await
        .unwrap();

    let website = db.add_website("Example", "example", "").await.unwrap();
    let list = db.add_urllist(website, "dedup", "Dedup", true).await.unwrap();
    let query = db.add_query(Some(website), "links", &link_query()).await.unwrap();

    let config = CrawlerConfig {
        start_page: format!("{host}/"),
        link_queries: vec![query],
        network: test_network(),
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

    let thread_id = server
        .start_thread("crawler", website, list, config_id)
        .await
        .unwrap();

    let ns = "example_dedup";

    let done = wait_for(|| async {
        let Ok(Some(y)) = db.url_id(ns, &format!("{host}/y")).await else {
            return false;
        };

        db.is_url_flagged(ns, y, ModuleFlag::Crawled).await.unwrap_or(false)
    })
    .await;

    assert!(done, "crawl never reached /y");

    // start page + /x + /y, each exactly once
    assert_eq!(db.url_count(ns).await.unwrap(), 3);

    server.stop_thread(thread_id).unwrap();

    wait_for(|| async { server.poll() == 0 }).await;
}
