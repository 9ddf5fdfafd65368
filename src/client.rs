//! Crawl orchestrator
//!
//! [`Client`] composes the fetch engine with the queue, storage, retry
//! scheduler and stats actor:
//! - submissions are deduplicated against storage and either queued or dispatched
//! - engine callbacks update stats and the persisted task lifecycle
//! - failures go through the retry policy and are resubmitted after backoff
//! - one cancellation token stops every background task
//!
//! A client must be created inside a tokio runtime.

use crate::config::Config;
use crate::engine::{
    extract_title, header_map, EngineError, FetchEngine, FetchFailure, FetchRequest,
    FetchResponse, Hooks, HttpTransport, RedirectHook, Transport, WorkTracker,
};
use crate::queue::{Queue, Request, RequestContext};
use crate::retry::{RetryDecision, RetryEvent, RetryPolicy, RetryScheduler, ScheduledRetry};
use crate::stats::{StatsSnapshot, StatsTracker};
use crate::storage::{
    open_storage, should_skip_item, should_skip_task, Item, ItemStatus, ItemType, Progress,
    Storage, StorageResult, Task, TaskDedup, TaskStatus,
};
use crate::{ConductorError, Result};
use reqwest::header::{HeaderMap, HeaderName, COOKIE, SET_COOKIE};
use reqwest::Method;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after cancelling so in-flight callbacks can observe the stop
const STOP_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Poll period of `process_queue` while the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(10);

const ABANDONED_RETRY_ERROR: &str = "retry abandoned: crawler stopped";

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Client lifecycle; a stopped client never runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => Self::Running,
            STATE_STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

enum Admission {
    Skip,
    Proceed { task_id: Option<String> },
}

impl Admission {
    fn context(task_id: Option<String>) -> RequestContext {
        match task_id {
            Some(id) => RequestContext::default().with_task_id(id),
            None => RequestContext::default(),
        }
    }
}

/// State shared by the engine callbacks and the retry loop
struct Orchestrator {
    storage: Option<Arc<dyn Storage>>,
    stats: StatsTracker,
    scheduler: RetryScheduler,
    policy: RetryPolicy,
    tracker: WorkTracker,
    print_headers: bool,
    print_cookies: bool,
    persist_items: bool,
}

impl Orchestrator {
    fn hooks(self: &Arc<Self>) -> Hooks {
        let mut hooks = Hooks::new();

        let this = self.clone();
        hooks.on_request(move |request| this.handle_request(request));

        let this = self.clone();
        hooks.on_response(move |response| this.handle_response(response));

        let this = self.clone();
        hooks.on_error(move |failure| this.handle_failure(failure));

        hooks
    }

    fn handle_request(&self, request: &FetchRequest) {
        self.stats.record_started();
        tracing::debug!(
            url = %request.url,
            method = %request.method,
            depth = request.depth,
            retry = request.ctx.retry_count,
            "Request started"
        );
        if self.print_headers {
            for (name, value) in &request.headers {
                tracing::debug!(url = %request.url, header = %name, value = ?value, "Request header");
            }
        }
        if self.print_cookies {
            for cookie in header_values(&request.headers, COOKIE) {
                tracing::debug!(url = %request.url, cookie, "Request cookie");
            }
        }

        if let Some(task_id) = &request.ctx.task_id {
            self.update_task(task_id, |task| task.set_status(TaskStatus::Running));
        }
    }

    fn handle_response(&self, response: &FetchResponse) {
        self.stats.record_success();
        tracing::info!(
            url = %response.request.url,
            status = response.status,
            bytes = response.body.len(),
            "Request succeeded"
        );
        if self.print_headers {
            for (name, value) in &response.headers {
                tracing::debug!(url = %response.request.url, header = %name, value = ?value, "Response header");
            }
        }
        if self.print_cookies {
            for cookie in header_values(&response.headers, SET_COOKIE) {
                tracing::debug!(url = %response.request.url, cookie, "Response cookie");
            }
        }

        let (Some(storage), Some(task_id)) = (&self.storage, &response.request.ctx.task_id) else {
            return;
        };

        if self.persist_items {
            if let Err(e) = persist_item(storage.as_ref(), task_id, response) {
                tracing::warn!(url = %response.request.url, error = %e, "Failed to persist item");
            }
        }

        self.update_task(task_id, |task| {
            task.error = None;
            task.set_status(TaskStatus::Completed);
        });
    }

    fn handle_failure(&self, failure: &FetchFailure) {
        self.stats.record_failure();

        let request = &failure.request;
        let retries = request.ctx.retry_count;
        tracing::warn!(
            url = %request.url,
            status = failure.status,
            error = %failure.message,
            retries,
            "Request failed"
        );

        match self.policy.evaluate(failure.status, &failure.message, retries) {
            RetryDecision::Retry { delay, attempt } => {
                tracing::info!(
                    url = %request.url,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scheduling retry"
                );

                if let Some(task_id) = &request.ctx.task_id {
                    self.update_task(task_id, |task| {
                        task.retries = attempt;
                        task.error = Some(failure.message.clone());
                    });
                }

                let mut resubmission = request.clone();
                resubmission.ctx.retry_count = attempt;
                let retry = ScheduledRetry::new(resubmission, delay, self.tracker.start());
                if let Err(refused) = self.scheduler.schedule(retry) {
                    self.abandon(refused);
                }
            }
            RetryDecision::Exhausted { retries } => {
                tracing::warn!(url = %request.url, retries, "Max retries reached");
                self.fail_task(request, &failure.message);
            }
            RetryDecision::NotRetryable => self.fail_task(request, &failure.message),
        }
    }

    /// Puts the task of a retry that will never run back to pending
    fn abandon(&self, retry: ScheduledRetry) {
        tracing::info!(
            url = %retry.request.url,
            attempt = retry.attempt(),
            "Retry abandoned: crawler stopped"
        );
        if let Some(task_id) = &retry.request.ctx.task_id {
            self.update_task(task_id, |task| {
                task.error = Some(ABANDONED_RETRY_ERROR.to_string());
                task.set_status(TaskStatus::Pending);
            });
        }
    }

    fn fail_task(&self, request: &FetchRequest, error: &str) {
        if let Some(task_id) = &request.ctx.task_id {
            self.finish_task(task_id, TaskStatus::Failed, error);
        }
    }

    fn finish_task(&self, task_id: &str, status: TaskStatus, error: &str) {
        self.update_task(task_id, |task| {
            task.error = Some(error.to_string());
            task.set_status(status);
        });
    }

    /// Read-modify-write of a persisted task; failures are logged
    fn update_task(&self, task_id: &str, change: impl FnOnce(&mut Task)) {
        let Some(storage) = &self.storage else {
            return;
        };

        let result = storage.get_task(task_id).and_then(|mut task| {
            change(&mut task);
            storage.update_task(&mut task)
        });
        if let Err(e) = result {
            tracing::warn!(task_id, error = %e, "Failed to update task");
        }
    }
}

/// Textual values of one header; values that are not visible ASCII are skipped
fn header_values(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|value| value.to_str().ok())
}

/// Saves the response as an item unless identical content was already saved
fn persist_item(storage: &dyn Storage, task_id: &str, response: &FetchResponse) -> StorageResult<Item> {
    let item_type = ItemType::from_content_type(response.content_type());
    let mut item = Item::new(task_id, response.request.url.as_str(), item_type);
    item.hash_bytes(&response.body);
    item.metadata
        .insert("status".to_string(), serde_json::json!(response.status));

    if matches!(item_type, ItemType::Html | ItemType::Data) {
        let text = response.text();
        if item_type == ItemType::Html {
            item.title = extract_title(&text);
        }
        item.content = Some(text);
    }

    match should_skip_item(storage, &item.content_hash)? {
        Some(existing) => {
            tracing::debug!(
                url = %item.url,
                duplicate_of = %existing.id,
                "Skipping duplicate content"
            );
            item.status = ItemStatus::Skipped;
            item.content = None;
            item.metadata
                .insert("duplicate_of".to_string(), serde_json::json!(existing.id));
        }
        None => item.status = ItemStatus::Saved,
    }

    storage.save_item(&mut item)?;
    Ok(item)
}

/// Resubmits due retries and settles abandoned ones
///
/// Exits once the scheduler has shut down and every event has been handled.
async fn drive_retries(
    mut events: mpsc::UnboundedReceiver<RetryEvent>,
    engine: FetchEngine,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        match event {
            RetryEvent::Due(retry) if cancel.is_cancelled() => orchestrator.abandon(retry),
            RetryEvent::Due(retry) => {
                let (request, guard) = retry.into_parts();
                let url = request.url.clone();
                let task_id = request.ctx.task_id.clone();

                // The engine takes its own guard before ours is released
                if let Err(e) = engine.request(request) {
                    tracing::warn!(url = %url, error = %e, "Retry could not be dispatched");
                    if let Some(task_id) = task_id {
                        orchestrator.finish_task(&task_id, TaskStatus::Failed, &e.to_string());
                    }
                }
                drop(guard);
            }
            RetryEvent::Abandoned(retry) => orchestrator.abandon(retry),
        }
    }
    tracing::debug!("Retry loop finished");
}

/// Converts a queued request into an engine request
fn build_fetch(request: &Request) -> Result<FetchRequest> {
    let method = if request.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(request.method.as_bytes())
            .map_err(|_| EngineError::InvalidMethod(request.method.clone()))?
    };

    let mut fetch = FetchRequest::parse(&request.url)?.with_method(method);
    fetch.depth = request.depth;
    fetch.priority = request.priority;
    fetch.timestamp = request.timestamp;
    if let Some(headers) = &request.headers {
        fetch.headers = header_map(headers)?;
    }
    Ok(fetch)
}

/// Crawl orchestration client
pub struct Client {
    config: Config,
    engine: FetchEngine,
    queue: Option<Queue>,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    state: AtomicU8,
    retry_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client backed by the HTTP transport
    ///
    /// # Arguments
    ///
    /// * `config` - Full configuration; validated here
    /// * `hooks` - Caller callbacks, run after the orchestration callbacks
    ///
    /// # Returns
    ///
    /// * `Ok(Client)` - Client ready to accept submissions
    /// * `Err(ConductorError)` - Invalid configuration, storage or HTTP client setup failure
    pub fn new(config: Config, hooks: Hooks) -> Result<Self> {
        Self::with_redirect_hook(config, hooks, None)
    }

    /// Like [`Client::new`], with a hook that approves or rejects each redirect
    pub fn with_redirect_hook(
        config: Config,
        hooks: Hooks,
        redirect_hook: Option<RedirectHook>,
    ) -> Result<Self> {
        let transport = HttpTransport::new(&config.crawler, redirect_hook)?;
        Self::with_transport(config, hooks, Arc::new(transport))
    }

    /// Creates a client on top of an arbitrary transport
    pub fn with_transport(config: Config, hooks: Hooks, transport: Arc<dyn Transport>) -> Result<Self> {
        crate::config::validate(&config)?;

        let storage = if config.storage.enabled {
            Some(open_storage(&config.storage)?)
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let tracker = WorkTracker::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Orchestrator {
            storage,
            stats: StatsTracker::spawn(cancel.clone(), config.logging.stats_interval()),
            scheduler: RetryScheduler::spawn(cancel.clone(), events_tx),
            policy: RetryPolicy::from_config(&config.retry),
            tracker: tracker.clone(),
            print_headers: config.logging.print_headers,
            print_cookies: config.logging.print_cookies,
            persist_items: config.storage.persist_items,
        });

        let mut all_hooks = orchestrator.hooks();
        all_hooks.extend(hooks);
        let engine = FetchEngine::new(config.crawler.clone(), transport, all_hooks, tracker);

        let retry_loop = tokio::spawn(drive_retries(
            events_rx,
            engine.clone(),
            orchestrator.clone(),
            cancel.clone(),
        ));

        let queue = config.queue.enabled.then(Queue::new);

        tracing::info!(
            storage = config.storage.enabled,
            queue = queue.is_some(),
            max_retries = config.retry.max_retries,
            "Client started"
        );

        Ok(Self {
            config,
            engine,
            queue,
            orchestrator,
            cancel,
            state: AtomicU8::new(STATE_RUNNING),
            retry_loop: Mutex::new(Some(retry_loop)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &FetchEngine {
        &self.engine
    }

    /// The priority queue, when enabled in the configuration
    pub fn queue(&self) -> Option<&Queue> {
        self.queue.as_ref()
    }

    /// The storage backend, when enabled in the configuration
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.orchestrator.storage.as_ref()
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.orchestrator.scheduler
    }

    /// Current request counters; `None` once the client is closed
    pub async fn stats(&self) -> Option<StatsSnapshot> {
        self.orchestrator.stats.snapshot().await
    }

    /// Progress computed from the persisted tasks; `None` without storage
    pub fn progress(&self) -> Result<Option<Progress>> {
        match &self.orchestrator.storage {
            Some(storage) => Ok(Some(storage.progress()?)),
            None => Ok(None),
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ConductorError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Runs task-level dedup and records the task to fetch
    fn admit(&self, url: &str, priority: i32) -> Result<Admission> {
        let Some(storage) = &self.orchestrator.storage else {
            return Ok(Admission::Proceed { task_id: None });
        };

        match should_skip_task(storage.as_ref(), url, self.config.storage.duplicate_strategy)? {
            TaskDedup::Skip(prior) => {
                tracing::info!(
                    url,
                    task_id = %prior.id,
                    status = %prior.status,
                    "Skipping task: already exists"
                );
                Ok(Admission::Skip)
            }
            TaskDedup::Proceed(Some(mut prior)) => {
                prior.priority = priority;
                prior.retries = 0;
                prior.error = None;
                prior.set_status(TaskStatus::Pending);
                storage.update_task(&mut prior)?;
                Ok(Admission::Proceed {
                    task_id: Some(prior.id),
                })
            }
            TaskDedup::Proceed(None) => {
                let mut task = Task::new(url)
                    .with_priority(priority)
                    .with_depth(1)
                    .with_max_retries(self.config.retry.max_retries);
                storage.save_task(&mut task)?;
                Ok(Admission::Proceed {
                    task_id: Some(task.id),
                })
            }
        }
    }

    /// Submits a URL
    ///
    /// Duplicates are skipped silently. With an enabled queue the URL is queued
    /// at priority 0; otherwise it is dispatched right away.
    pub fn visit(&self, url: &str) -> Result<()> {
        self.ensure_running()?;

        // Nothing is recorded for a URL that can never be fetched
        let fetch = FetchRequest::parse(url)?;

        let Admission::Proceed { task_id } = self.admit(url, 0)? else {
            return Ok(());
        };
        let ctx = Admission::context(task_id);

        match &self.queue {
            Some(queue) if queue.is_enabled() => {
                queue.add(Request::new(url).with_depth(1).with_ctx(ctx));
                Ok(())
            }
            _ => self.dispatch(fetch.with_ctx(ctx)),
        }
    }

    /// Queues a URL at `priority`; lower values are fetched first
    pub fn visit_with_priority(&self, url: &str, priority: i32) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(ConductorError::QueueDisabled)?;
        self.ensure_running()?;
        FetchRequest::parse(url)?;

        let Admission::Proceed { task_id } = self.admit(url, priority)? else {
            return Ok(());
        };

        queue.add(
            Request::new(url)
                .with_priority(priority)
                .with_depth(1)
                .with_ctx(Admission::context(task_id)),
        );
        Ok(())
    }

    /// Drains the queue through [`Client::execute_request`]
    ///
    /// With `stop_when_empty` the call returns once the queue is empty;
    /// otherwise it keeps polling for new requests until the client is stopped.
    pub async fn process_queue(&self, stop_when_empty: bool) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(ConductorError::QueueDisabled)?;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Queue processing stopped: crawler cancelled");
                break;
            }

            match queue.pop() {
                Some(request) => {
                    let url = request.url.clone();
                    if let Err(e) = self.execute_request(request) {
                        tracing::warn!(url, error = %e, "Request execution failed");
                    }
                }
                None if stop_when_empty => {
                    tracing::info!("Queue processing finished: queue is empty");
                    break;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Hands a queued request to the fetch engine
    ///
    /// Priority, depth, timestamp, headers and context pairs are carried over.
    /// A request whose task id is missing, or no longer stored, is registered
    /// with storage first. A request that cannot be built marks its task skipped.
    pub fn execute_request(&self, request: Request) -> Result<()> {
        self.ensure_running()?;

        let fetch = match build_fetch(&request) {
            Ok(fetch) => fetch,
            Err(e) => {
                if let Some(task_id) = &request.ctx.task_id {
                    self.orchestrator
                        .finish_task(task_id, TaskStatus::Skipped, &e.to_string());
                }
                return Err(e);
            }
        };

        let mut ctx = request.ctx;
        if !self.is_stored_task(ctx.task_id.as_deref())? {
            match self.admit(&request.url, request.priority)? {
                Admission::Skip => return Ok(()),
                Admission::Proceed { task_id } => ctx.task_id = task_id,
            }
        }

        self.dispatch(fetch.with_ctx(ctx))
    }

    /// Whether a request's task can be updated as it is processed
    ///
    /// Always true without storage, since there is nothing to register.
    fn is_stored_task(&self, task_id: Option<&str>) -> Result<bool> {
        let Some(storage) = &self.orchestrator.storage else {
            return Ok(true);
        };
        let Some(task_id) = task_id else {
            return Ok(false);
        };

        match storage.get_task(task_id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                tracing::debug!(task_id, "Task of queued request no longer stored");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&self, request: FetchRequest) -> Result<()> {
        let task_id = request.ctx.task_id.clone();
        if let Err(e) = self.engine.request(request) {
            if let Some(task_id) = task_id {
                self.orchestrator
                    .finish_task(&task_id, TaskStatus::Skipped, &e.to_string());
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits for in-flight requests and pending retries to drain
    ///
    /// Returns early if the client is stopped.
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.engine.wait() => {}
            _ = self.cancel.cancelled() => {
                tracing::info!("Wait returned early: crawler stopped");
            }
        }
    }

    /// Cancels all outstanding work
    ///
    /// Pending retries are abandoned and queue processing ends. Calling it
    /// again has no effect.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tracing::info!("Stopping crawler, cancelling outstanding requests");
        self.cancel.cancel();
        tokio::time::sleep(STOP_GRACE_PERIOD).await;
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        tracing::info!("Crawler stopped");
    }

    /// Stops the client and releases stats and storage
    pub async fn close(&self) -> Result<()> {
        self.stop().await;

        self.orchestrator.stats.shutdown().await;
        self.orchestrator.scheduler.join().await;

        let retry_loop = self
            .retry_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = retry_loop {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Retry loop panicked");
            }
        }

        if let Some(storage) = &self.orchestrator.storage {
            storage.close()?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Lets the background tasks exit when the client is dropped without close()
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawResponse, TransportError};
    use crate::storage::{StorageType, TaskFilter};
    use async_trait::async_trait;

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn send(&self, _request: &FetchRequest) -> std::result::Result<RawResponse, TransportError> {
            Ok(RawResponse::new(200, "<html><head><title>Home</title></head></html>")
                .with_content_type("text/html"))
        }
    }

    fn test_config(queue: bool) -> Config {
        let mut config = Config::default();
        config.crawler.delay_ms = 0;
        config.crawler.random_delay_ms = 0;
        config.queue.enabled = queue;
        config.storage.enabled = true;
        config.storage.storage_type = StorageType::Memory;
        config.logging.stats_interval_secs = 0;
        config
    }

    fn client(config: Config) -> Client {
        Client::with_transport(config, Hooks::new(), Arc::new(OkTransport)).unwrap()
    }

    #[tokio::test]
    async fn test_visit_records_completed_task_and_item() {
        let client = client(test_config(false));

        client.visit("http://x/home").unwrap();
        client.wait().await;

        let storage = client.storage().unwrap();
        let task = storage.get_task_by_url("http://x/home").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.max_retries, 3);

        let items = storage
            .list_items(&crate::storage::ItemFilter::for_task(&task.id))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ItemStatus::Saved);
        assert_eq!(items[0].item_type, ItemType::Html);
        assert_eq!(items[0].title.as_deref(), Some("Home"));
        assert_eq!(items[0].content_hash.len(), 64);

        let stats = client.stats().await.unwrap();
        assert_eq!((stats.total, stats.success, stats.remaining), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_duplicate_content_is_recorded_as_skipped() {
        let client = client(test_config(false));

        client.visit("http://x/a").unwrap();
        client.visit("http://x/b").unwrap();
        client.wait().await;

        let storage = client.storage().unwrap();
        let items = storage.list_items(&Default::default()).unwrap();
        assert_eq!(items.len(), 2);

        let saved: Vec<_> = items.iter().filter(|i| i.status == ItemStatus::Saved).collect();
        let skipped: Vec<_> = items.iter().filter(|i| i.status == ItemStatus::Skipped).collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(skipped.len(), 1);
        assert_eq!(
            skipped[0].metadata.get("duplicate_of"),
            Some(&serde_json::json!(saved[0].id))
        );
    }

    #[tokio::test]
    async fn test_completed_url_is_not_fetched_again() {
        let client = client(test_config(false));

        client.visit("http://x/once").unwrap();
        client.wait().await;
        client.visit("http://x/once").unwrap();
        client.wait().await;

        let storage = client.storage().unwrap();
        assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 1);
        assert_eq!(client.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_queue_required_for_priority_visits() {
        let client = client(test_config(false));

        assert!(matches!(
            client.visit_with_priority("http://x/1", 5),
            Err(ConductorError::QueueDisabled)
        ));
        assert!(matches!(
            client.process_queue(true).await,
            Err(ConductorError::QueueDisabled)
        ));
    }

    #[tokio::test]
    async fn test_visit_is_queued_when_queue_enabled() {
        let client = client(test_config(true));

        client.visit("http://x/later").unwrap();
        client.visit_with_priority("http://x/first", -1).unwrap();

        let queue = client.queue().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(client.stats().await.unwrap().total, 0);

        client.process_queue(true).await.unwrap();
        client.wait().await;

        assert!(queue.is_empty());
        let storage = client.storage().unwrap();
        let completed = storage
            .count_tasks(&TaskFilter::with_status([TaskStatus::Completed]))
            .unwrap();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let client = client(test_config(true));

        let err = client
            .execute_request(Request::new("http://x/1").with_method("BAD METHOD"))
            .unwrap_err();
        assert!(matches!(err, ConductorError::Engine(EngineError::InvalidMethod(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_after_stop() {
        let client = client(test_config(true));
        assert_eq!(client.lifecycle(), LifecycleState::Running);

        client.stop().await;
        assert_eq!(client.lifecycle(), LifecycleState::Stopped);

        // Second stop is a no-op
        client.stop().await;
        assert_eq!(client.lifecycle(), LifecycleState::Stopped);

        assert!(matches!(client.visit("http://x/1"), Err(ConductorError::Stopped)));
        assert!(matches!(
            client.visit_with_priority("http://x/1", 1),
            Err(ConductorError::Stopped)
        ));
        assert!(matches!(
            client.execute_request(Request::new("http://x/1")),
            Err(ConductorError::Stopped)
        ));

        // Returns immediately instead of polling forever
        client.process_queue(false).await.unwrap();
        client.wait().await;

        client.close().await.unwrap();
        assert!(client.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_url_records_nothing() {
        let client = client(test_config(false));

        let err = client.visit("not a url").unwrap_err();
        assert!(matches!(err, ConductorError::Engine(EngineError::InvalidUrl(_))));

        let storage = client.storage().unwrap();
        assert!(storage.list_tasks(&TaskFilter::default()).unwrap().is_empty());
        let progress = client.progress().unwrap().unwrap();
        assert_eq!((progress.total, progress.pending), (0, 0));
    }

    #[tokio::test]
    async fn test_unparseable_url_is_not_queued() {
        let client = client(test_config(true));

        assert!(client.visit("not a url").is_err());
        assert!(client.visit_with_priority("::", 1).is_err());

        assert!(client.queue().unwrap().is_empty());
        let storage = client.storage().unwrap();
        assert_eq!(storage.count_tasks(&TaskFilter::default()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unbuildable_queued_request_marks_task_skipped() {
        let client = client(test_config(true));
        client.visit_with_priority("http://x/1", 0).unwrap();

        let mut request = client.queue().unwrap().pop().unwrap();
        request.method = "BAD METHOD".to_string();
        assert!(client.execute_request(request).is_err());

        let task = client.storage().unwrap().get_task_by_url("http://x/1").unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert!(task.error.unwrap().contains("BAD METHOD"));
    }

    #[tokio::test]
    async fn test_request_with_unknown_task_id_is_registered() {
        let client = client(test_config(true));
        let ctx = RequestContext::default().with_task_id("no-such-task");

        client
            .execute_request(Request::new("http://x/restored").with_ctx(ctx))
            .unwrap();
        client.wait().await;

        let task = client
            .storage()
            .unwrap()
            .get_task_by_url("http://x/restored")
            .unwrap();
        assert_ne!(task.id, "no-such-task");
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_header_values_lists_each_cookie() {
        use reqwest::header::HeaderValue;

        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let cookies: Vec<&str> = header_values(&headers, SET_COOKIE).collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(header_values(&headers, COOKIE).count(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_domain_marks_task_skipped() {
        let mut config = test_config(false);
        config.crawler.allowed_domains = vec!["example.com".to_string()];
        let client = client(config);

        let err = client.visit("http://other.org/").unwrap_err();
        assert!(matches!(err, ConductorError::Engine(EngineError::ForbiddenDomain(_))));

        let task = client.storage().unwrap().get_task_by_url("http://other.org/").unwrap();
        assert_eq!(task.status, TaskStatus::Skipped);
        assert!(task.error.unwrap().contains("Forbidden domain"));
    }
}
