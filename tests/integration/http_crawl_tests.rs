//! Integration tests over real HTTP
//!
//! These tests use wiremock to create mock HTTP servers and run the client with
//! the reqwest transport and SQLite storage.

use crawl_conductor::config::Config;
use crawl_conductor::engine::{HtmlElement, Hooks};
use crawl_conductor::storage::{ItemFilter, ItemStatus, ItemType, TaskStatus};
use crawl_conductor::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration storing into `dir`
fn create_test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.crawler.delay_ms = 0;
    config.crawler.random_delay_ms = 0;
    config.crawler.user_agent = "TestBot/1.0".to_string();
    config.storage.enabled = true;
    config.storage.dir = dir.path().to_path_buf();
    config.logging.stats_interval_secs = 0;
    config
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "text/html; charset=utf-8")
}

#[tokio::test]
async fn test_fetch_persists_task_and_item() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<html><head><title>Home</title></head><body>
            <a href="/page1">Page 1</a>
            <a href="/page2">Page 2</a>
            </body></html>"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let links = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = Hooks::new();
    let found = links.clone();
    hooks
        .on_html("a[href]", move |el: &HtmlElement<'_>| {
            if let Some(url) = el.absolute_url("href") {
                found.lock().unwrap().push(url.path().to_string());
            }
        })
        .unwrap();

    let client = Client::new(create_test_config(&dir), hooks).unwrap();
    let seed = format!("{}/", mock_server.uri());
    client.visit(&seed).unwrap();
    client.wait().await;

    assert_eq!(*links.lock().unwrap(), vec!["/page1", "/page2"]);

    let storage = client.storage().unwrap();
    let task = storage.get_task_by_url(&seed).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let items = storage.list_items(&ItemFilter::for_task(&task.id)).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_type, ItemType::Html);
    assert_eq!(items[0].status, ItemStatus::Saved);
    assert_eq!(items[0].title.as_deref(), Some("Home"));

    client.close().await.unwrap();
    assert!(dir.path().join("crawler.db").exists());
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(html("<html><title>Back</title></html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::new(create_test_config(&dir), Hooks::new()).unwrap();
    let url = format!("{}/flaky", mock_server.uri());
    client.visit(&url).unwrap();
    client.wait().await;

    let task = client.storage().unwrap().get_task_by_url(&url).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_not_found_fails_without_retry() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::new(create_test_config(&dir), Hooks::new()).unwrap();
    let url = format!("{}/missing", mock_server.uri());
    client.visit(&url).unwrap();
    client.wait().await;

    let task = client.storage().unwrap().get_task_by_url(&url).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Not Found"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_reported_as_failure() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(html("<html></html>").set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&dir);
    config.crawler.request_timeout_ms = 200;
    config.retry.max_retries = 0;
    let client = Client::new(config, Hooks::new()).unwrap();

    let url = format!("{}/slow", mock_server.uri());
    client.visit(&url).unwrap();
    client.wait().await;

    let task = client.storage().unwrap().get_task_by_url(&url).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timeout"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_robots_disallow_blocks_fetch() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private"))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/private/page"))
        .respond_with(html("<html></html>"))
        .expect(0) // Should never be called
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&dir);
    config.crawler.ignore_robots_txt = false;
    let client = Client::new(config, Hooks::new()).unwrap();

    let url = format!("{}/private/page", mock_server.uri());
    client.visit(&url).unwrap();
    client.wait().await;

    let task = client.storage().unwrap().get_task_by_url(&url).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("robots.txt"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_redirect_limit() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    for (from, to) in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/done")] {
        Mock::given(method("GET"))
            .and(path(from))
            .respond_with(ResponseTemplate::new(302).insert_header("location", to))
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/done"))
        .respond_with(html("<html><title>Done</title></html>"))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&dir);
    config.crawler.max_redirects = 1;
    config.retry.max_retries = 0;
    let client = Client::new(config, Hooks::new()).unwrap();

    let url = format!("{}/r1", mock_server.uri());
    client.visit(&url).unwrap();
    client.wait().await;

    let task = client.storage().unwrap().get_task_by_url(&url).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("redirect"));

    client.close().await.unwrap();
}
