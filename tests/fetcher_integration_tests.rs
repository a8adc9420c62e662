use std::time::Duration;

use chrono::Utc;
use feedfetchd::infrastructure::database::setup_database;
use feedfetchd::infrastructure::fetcher::Fetcher;
use feedfetchd::infrastructure::ssrf::new_safe_client;
use feedfetchd::infrastructure::stores::{SqliteFeedStore, SqliteItemStore, SqliteSubscriptionStore};
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Feed</title>
    <link>https://example.com</link>
    <description>An example feed</description>
    <item>
      <title>First post</title>
      <link>https://example.com/1</link>
      <guid>https://example.com/1</guid>
      <description>Hello, world.</description>
      <pubDate>Mon, 01 Jan 2026 00:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second post</title>
      <link>https://example.com/2</link>
      <guid>https://example.com/2</guid>
      <description>Another entry.</description>
      <pubDate>Tue, 02 Jan 2026 00:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

async fn test_pool() -> SqlitePool {
    let pool = setup_database("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// A fetcher pointed at a local `wiremock` server: the SSRF guard's private-IP
/// check on `feed_url` is disabled (wiremock listens on loopback), but
/// everything downstream (conditional GET, classification, parsing, upsert,
/// retry policy) runs exactly as it does in production.
fn test_fetcher(pool: SqlitePool) -> (Fetcher, SqliteFeedStore) {
    let feed_store = SqliteFeedStore::new(pool.clone());
    let item_store = SqliteItemStore::new(pool.clone());
    let subscription_store = SqliteSubscriptionStore::new(pool);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let fetcher = Fetcher::new_with_ssrf_guard_disabled(
        client,
        feed_store.clone(),
        item_store,
        subscription_store,
        1024 * 1024,
    );
    (fetcher, feed_store)
}

// S1 — first successful fetch inserts both entries and clears error state.
#[tokio::test]
async fn successful_fetch_inserts_items_and_advances_next_fetch() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(SAMPLE_RSS)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let (fetcher, feed_store) = test_fetcher(pool);
    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();

    assert_eq!(report.outcome, "success");
    assert_eq!(report.inserted, 2);
    assert_eq!(report.updated, 0);

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(stored.is_active());
    assert_eq!(stored.consecutive_errors, 0);
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
    assert!(stored.next_fetch_at > now);
}

// S2 — conditional GET honored: a 304 leaves items untouched and resets errors.
#[tokio::test]
async fn not_modified_response_does_not_touch_items() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let (fetcher, feed_store) = test_fetcher(pool);
    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let mut feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    feed.etag = Some("\"v1\"".to_string());
    feed_store.update_fetch_state(&feed).await.unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();

    assert_eq!(report.outcome, "not_modified");
    assert_eq!(report.inserted, 0);

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(stored.is_active());
    assert_eq!(stored.consecutive_errors, 0);
}

// S3 — permanently gone: feed is stopped, never scheduled again.
#[tokio::test]
async fn not_found_stops_the_feed() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let (fetcher, feed_store) = test_fetcher(pool);
    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();
    assert_eq!(report.outcome, "stop");

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(!stored.is_active());
    assert_eq!(stored.next_fetch_at, feed.next_fetch_at);
}

// S4 — transient 500 backs off without stopping the feed.
#[tokio::test]
async fn server_error_backs_off_without_stopping() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let (fetcher, feed_store) = test_fetcher(pool);
    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();
    assert_eq!(report.outcome, "backoff");

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(stored.is_active());
    assert_eq!(stored.consecutive_errors, 1);
    assert_eq!(stored.next_fetch_at, now + chrono::Duration::minutes(30));
}

// S5 — malformed body is a parse failure, not a backoff.
#[tokio::test]
async fn malformed_body_is_a_parse_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not xml at all"))
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let (fetcher, feed_store) = test_fetcher(pool);
    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();
    assert_eq!(report.outcome, "parse_failure");

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(stored.is_active());
    assert_eq!(stored.consecutive_errors, 1);
}

// S6 — a body larger than the cap is also a parse failure, read before any parsing is attempted.
#[tokio::test]
async fn oversized_body_is_rejected_before_parsing() {
    let mock_server = MockServer::start().await;
    let oversized = "x".repeat(2048);
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(oversized))
        .mount(&mock_server)
        .await;

    let pool = test_pool().await;
    let feed_store = SqliteFeedStore::new(pool.clone());
    let item_store = SqliteItemStore::new(pool.clone());
    let subscription_store = SqliteSubscriptionStore::new(pool);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    // Tiny cap so a 2KB body is rejected.
    let fetcher = Fetcher::new_with_ssrf_guard_disabled(
        client,
        feed_store.clone(),
        item_store,
        subscription_store,
        128,
    );

    let now = Utc::now();
    let feed_id = feed_store
        .insert(&format!("{}/feed.xml", mock_server.uri()), "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();
    assert_eq!(report.outcome, "parse_failure");
    assert_eq!(report.inserted, 0);
}

// SSRF guard rejects a feed URL pointed at a loopback address without ever
// dialing wiremock. Uses the real, guard-enforcing constructor, unlike the
// scenario tests above.
#[tokio::test]
async fn loopback_feed_url_is_rejected_by_ssrf_guard() {
    let pool = test_pool().await;
    let feed_store = SqliteFeedStore::new(pool.clone());
    let item_store = SqliteItemStore::new(pool.clone());
    let subscription_store = SqliteSubscriptionStore::new(pool);
    let client = new_safe_client(Duration::from_secs(5)).unwrap();
    let fetcher = Fetcher::new(client, feed_store.clone(), item_store, subscription_store, 1024 * 1024);

    let now = Utc::now();
    let feed_id = feed_store
        .insert("http://127.0.0.1:1/feed.xml", "Example", now)
        .await
        .unwrap();
    let feed = feed_store.get_by_id(feed_id).await.unwrap().unwrap();

    let report = fetcher.fetch_one(&feed, now).await.unwrap();
    assert_eq!(report.outcome, "stop");

    let stored = feed_store.get_by_id(feed_id).await.unwrap().unwrap();
    assert!(!stored.is_active());
}
