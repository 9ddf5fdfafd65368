//! Integration tests for the orchestration layer
//!
//! These tests drive a [`Client`] over a scripted transport with tokio's clock
//! paused, so backoff timing can be asserted without real waits.

use async_trait::async_trait;
use crawl_conductor::config::Config;
use crawl_conductor::engine::{FetchRequest, Hooks, RawResponse, Transport, TransportError};
use crawl_conductor::storage::{StorageType, Task, TaskFilter, TaskStatus};
use crawl_conductor::{Client, ConductorError, Request};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// Answers each path from a per-path script of status codes, then with 200
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(self: &Arc<Self>, path: &str, statuses: impl IntoIterator<Item = u16>) -> Arc<Self> {
        self.scripts
            .lock()
            .unwrap()
            .insert(path.to_string(), statuses.into_iter().collect());
        self.clone()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
        let path = request.url.path().to_string();
        self.calls.lock().unwrap().push((path.clone(), Instant::now()));

        let status = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(200);

        Ok(RawResponse::new(status, format!("<html><title>{}</title></html>", path))
            .with_content_type("text/html"))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.crawler.delay_ms = 0;
    config.crawler.random_delay_ms = 0;
    config.storage.enabled = true;
    config.storage.storage_type = StorageType::Memory;
    config.logging.stats_interval_secs = 0;
    config
}

/// Paused time lands on timer deadlines, give or take the timer wheel's resolution
fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(50),
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

fn client_with(config: Config, transport: &Arc<ScriptedTransport>) -> Client {
    Client::with_transport(config, Hooks::new(), transport.clone()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_success_with_backoff() {
    let transport = ScriptedTransport::new().script("/flaky", [503, 503, 200]);
    let client = client_with(test_config(), &transport);

    client.visit("http://x/flaky").unwrap();
    client.wait().await;

    assert_eq!(transport.calls(), vec!["/flaky", "/flaky", "/flaky"]);
    let times = transport.call_times();
    assert_close(times[1] - times[0], Duration::from_secs(1));
    assert_close(times[2] - times[1], Duration::from_secs(2));

    let task = client
        .storage()
        .unwrap()
        .get_task_by_url("http://x/flaky")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries, 2);
    assert!(task.error.is_none());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.remaining, 0);

    assert_eq!(client.retries().scheduled(), 2);
    assert_eq!(client.retries().fired(), 2);
    assert_eq!(client.retries().pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_task() {
    let transport = ScriptedTransport::new().script("/down", [503; 10]);
    let client = client_with(test_config(), &transport);
    let start = Instant::now();

    client.visit("http://x/down").unwrap();
    client.wait().await;

    // One attempt plus three retries after 1 s, 2 s and 4 s
    assert_eq!(transport.calls().len(), 4);
    assert_close(start.elapsed(), Duration::from_secs(7));

    let task = client
        .storage()
        .unwrap()
        .get_task_by_url("http://x/down")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retries, 3);
    assert_eq!(task.error.as_deref(), Some("Service Unavailable"));
    assert!(task.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_never_retried() {
    let transport = ScriptedTransport::new().script("/gone", [404, 200]);
    let mut config = test_config();
    config.retry.retry_http_codes.push(404);
    let client = client_with(config, &transport);

    client.visit("http://x/gone").unwrap();
    client.wait().await;

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(client.retries().scheduled(), 0);

    let task = client
        .storage()
        .unwrap()
        .get_task_by_url("http://x/gone")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_pending_retry() {
    let transport = ScriptedTransport::new().script("/slow", [503, 503]);
    let client = client_with(test_config(), &transport);

    client.visit("http://x/slow").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.retries().pending(), 1);

    let start = Instant::now();
    client.stop().await;
    client.wait().await;
    assert!(start.elapsed() < Duration::from_millis(150));

    // Well past the 1 s backoff: nothing is resubmitted
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.calls().len(), 1);
    assert_eq!(client.retries().abandoned(), 1);
    assert_eq!(client.retries().fired(), 0);

    let task = client
        .storage()
        .unwrap()
        .get_task_by_url("http://x/slow")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.error.as_deref(), Some("retry abandoned: crawler stopped"));

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_running_prior_task_blocks_visit() {
    let transport = ScriptedTransport::new();
    let client = client_with(test_config(), &transport);
    let storage = client.storage().unwrap().clone();

    let mut prior = Task::new("http://x/1");
    prior.set_status(TaskStatus::Running);
    storage.save_task(&mut prior).unwrap();

    client.visit("http://x/1").unwrap();
    client.wait().await;

    assert!(transport.calls().is_empty());
    assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 1);
    assert_eq!(storage.get_task(&prior.id).unwrap().status, TaskStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_failed_and_paused_priors_are_resubmitted() {
    let transport = ScriptedTransport::new();
    let client = client_with(test_config(), &transport);
    let storage = client.storage().unwrap().clone();

    let mut failed = Task::new("http://x/failed");
    failed.set_status(TaskStatus::Failed);
    storage.save_task(&mut failed).unwrap();

    let mut paused = Task::new("http://x/paused");
    paused.set_status(TaskStatus::Paused);
    storage.save_task(&mut paused).unwrap();

    client.visit("http://x/failed").unwrap();
    client.visit("http://x/paused").unwrap();
    client.wait().await;

    assert_eq!(transport.calls().len(), 2);
    assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 2);
    assert_eq!(storage.get_task(&failed.id).unwrap().status, TaskStatus::Completed);
    assert_eq!(storage.get_task(&paused.id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_queue_dispatches_in_priority_order() {
    let transport = ScriptedTransport::new();
    let mut config = test_config();
    config.queue.enabled = true;
    let client = client_with(config, &transport);

    client.visit_with_priority("http://x/a", 2).unwrap();
    client.visit_with_priority("http://x/b", 1).unwrap();
    client.visit_with_priority("http://x/c", 1).unwrap();
    client.visit("http://x/d").unwrap();

    client.process_queue(true).await.unwrap();
    client.wait().await;

    assert_eq!(transport.calls(), vec!["/d", "/b", "/c", "/a"]);
}

#[tokio::test(start_paused = true)]
async fn test_process_queue_returns_on_stop() {
    let transport = ScriptedTransport::new();
    let mut config = test_config();
    config.queue.enabled = true;
    let client = client_with(config, &transport);

    let start = Instant::now();
    let (processed, _) = tokio::join!(client.process_queue(false), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.stop().await;
    });

    processed.unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(matches!(
        client.visit_with_priority("http://x/late", 0),
        Err(ConductorError::Stopped)
    ));
}

#[tokio::test]
async fn test_queue_snapshot_resumes_in_new_client() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("queue.json");

    let mut config = test_config();
    config.queue.enabled = true;
    config.storage.storage_type = StorageType::Sqlite;
    config.storage.dir = dir.path().to_path_buf();

    let transport = ScriptedTransport::new();
    let first = client_with(config.clone(), &transport);
    first.visit_with_priority("http://x/later", 5).unwrap();
    first.visit_with_priority("http://x/sooner", 1).unwrap();
    assert_eq!(first.queue().unwrap().save_to_file(&snapshot).unwrap(), 2);
    first.close().await.unwrap();
    assert!(transport.calls().is_empty());

    let second = client_with(config, &transport);
    assert_eq!(second.queue().unwrap().load_from_file(&snapshot).unwrap(), 2);
    second.process_queue(true).await.unwrap();
    second.wait().await;

    assert_eq!(transport.calls(), vec!["/sooner", "/later"]);
    let storage = second.storage().unwrap();
    assert_eq!(
        storage
            .count_tasks(&TaskFilter::with_status([TaskStatus::Completed]))
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_snapshot_restored_after_clear_is_recorded_again() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("queue.json");

    let mut config = test_config();
    config.queue.enabled = true;
    let transport = ScriptedTransport::new();
    let client = client_with(config, &transport);

    client.visit_with_priority("http://x/kept", 1).unwrap();
    let queue = client.queue().unwrap();
    assert_eq!(queue.save_to_file(&snapshot).unwrap(), 1);
    queue.clear();

    // A fresh start wipes the tasks the snapshot still points at
    let storage = client.storage().unwrap();
    storage.clear().unwrap();
    assert_eq!(queue.load_from_file(&snapshot).unwrap(), 1);

    client.process_queue(true).await.unwrap();
    client.wait().await;

    assert_eq!(transport.calls(), vec!["/kept"]);
    let task = storage.get_task_by_url("http://x/kept").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 1);
}

#[tokio::test]
async fn test_execute_request_carries_headers_and_depth() {
    struct Capture(Mutex<Vec<FetchRequest>>);

    #[async_trait]
    impl Transport for Capture {
        async fn send(&self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
            self.0.lock().unwrap().push(request.clone());
            Ok(RawResponse::new(200, "ok").with_content_type("text/plain"))
        }
    }

    let transport = Arc::new(Capture(Mutex::new(Vec::new())));
    let mut config = test_config();
    config.crawler.max_depth = 3;
    let client = Client::with_transport(config, Hooks::new(), transport.clone()).unwrap();

    let mut request = Request::new("http://x/api")
        .with_method("POST")
        .with_priority(4)
        .with_depth(2);
    request.add_header("x-trace", "abc");
    request.ctx.put("source", "sitemap");

    client.execute_request(request).unwrap();
    client.wait().await;

    let sent = transport.0.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, reqwest::Method::POST);
    assert_eq!(sent[0].depth, 2);
    assert_eq!(sent[0].priority, 4);
    assert_eq!(sent[0].headers.get("x-trace").unwrap(), "abc");
    assert_eq!(sent[0].ctx.get("source"), Some("sitemap"));
    assert!(sent[0].ctx.task_id.is_some());
}
