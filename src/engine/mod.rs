//! Fetch engine
//!
//! This module performs the actual page fetches for the orchestrator:
//! - request validation (URL, depth, domain lists, revisit tracking)
//! - per-host parallelism limits with a politeness delay and jitter
//! - robots.txt checks and an optional on-disk response cache
//! - request / response / HTML / error callbacks
//!
//! Every accepted request runs in its own tokio task. [`FetchEngine::wait`]
//! resolves once all tracked work has drained.

mod cache;
mod domain;
mod hooks;
mod request;
mod robots;
mod transport;

pub use cache::FileCache;
pub use domain::{extract_domain, matches_wildcard, validate_domain_pattern, DomainFilter};
pub use hooks::{extract_title, ErrorHook, HtmlElement, HtmlHandler, Hooks, RequestHook, ResponseHook};
pub use request::{header_map, FetchFailure, FetchRequest, FetchResponse, RawResponse};
pub use robots::{ParsedRobots, RobotsCache};
pub use transport::{HttpTransport, RedirectHook, Transport, TransportError};

use crate::config::CrawlerConfig;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

/// Reasons a request is refused before it is dispatched
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Max depth limit reached: depth {depth} > {max}")]
    MaxDepth { depth: u32, max: u32 },

    #[error("Forbidden domain: {0}")]
    ForbiddenDomain(String),

    #[error("URL already visited: {0}")]
    AlreadyVisited(String),

    #[error("URL blocked by robots.txt: {0}")]
    RobotsDenied(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts outstanding units of work
///
/// Anything holding a [`WorkGuard`] keeps [`WorkTracker::wait`] pending. The
/// engine holds one per in-flight request and the retry scheduler one per
/// pending retry.
#[derive(Clone)]
pub struct WorkTracker {
    inner: Arc<TrackerInner>,
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn start(&self) -> WorkGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves when no work is outstanding
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop cannot be missed
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One unit of tracked work; released on drop
pub struct WorkGuard {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

struct EngineInner {
    config: CrawlerConfig,
    transport: Arc<dyn Transport>,
    hooks: Hooks,
    tracker: WorkTracker,
    domains: DomainFilter,
    visited: Mutex<HashSet<String>>,
    host_limits: Mutex<HashMap<String, Arc<Semaphore>>>,
    robots: RobotsCache,
    cache: Option<FileCache>,
}

/// Concurrent fetch engine
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl FetchEngine {
    /// Creates an engine
    ///
    /// # Arguments
    ///
    /// * `config` - Engine options (depth, domains, parallelism, delays, ...)
    /// * `transport` - Network backend
    /// * `hooks` - Callbacks invoked for every request
    /// * `tracker` - Work tracker shared with anything that defers requests
    pub fn new(
        config: CrawlerConfig,
        transport: Arc<dyn Transport>,
        hooks: Hooks,
        tracker: WorkTracker,
    ) -> Self {
        let domains = DomainFilter::new(&config.allowed_domains, &config.disallowed_domains);
        let cache = config.cache_dir.clone().map(FileCache::new);

        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                hooks,
                tracker,
                domains,
                visited: Mutex::new(HashSet::new()),
                host_limits: Mutex::new(HashMap::new()),
                robots: RobotsCache::new(),
                cache,
            }),
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &WorkTracker {
        &self.inner.tracker
    }

    /// Validates a request and dispatches it to a background task
    ///
    /// Validation errors are returned here; everything after dispatch is
    /// reported through the callbacks. Must be called within a tokio runtime.
    pub fn request(&self, request: FetchRequest) -> Result<(), EngineError> {
        self.inner.validate(&request)?;

        let guard = self.inner.tracker.start();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.process(request).await;
            drop(guard);
        });
        Ok(())
    }

    /// Convenience for a depth-1 GET
    pub fn visit(&self, url: &str) -> Result<(), EngineError> {
        self.request(FetchRequest::parse(url)?)
    }

    /// Resolves once every dispatched request, and any other tracked work, has finished
    pub async fn wait(&self) {
        self.inner.tracker.wait().await
    }
}

impl EngineInner {
    fn validate(&self, request: &FetchRequest) -> Result<(), EngineError> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(EngineError::InvalidUrl(format!(
                "unsupported scheme in {}",
                request.url
            )));
        }

        let max = self.config.max_depth;
        if max > 0 && request.depth > max {
            return Err(EngineError::MaxDepth {
                depth: request.depth,
                max,
            });
        }

        let domain = extract_domain(&request.url)
            .ok_or_else(|| EngineError::InvalidUrl(format!("no host in {}", request.url)))?;
        if !self.domains.permits(&domain) {
            return Err(EngineError::ForbiddenDomain(domain));
        }

        // Retries must get through the revisit check
        if !self.config.allow_url_revisit && request.ctx.retry_count == 0 {
            let mut visited = self.visited.lock().unwrap_or_else(PoisonError::into_inner);
            if !visited.insert(request.revisit_key()) {
                return Err(EngineError::AlreadyVisited(request.url.to_string()));
            }
        }

        Ok(())
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.host_limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.parallelism.max(1))))
            .clone()
    }

    async fn process(self: Arc<Self>, request: FetchRequest) {
        let semaphore = self.host_semaphore(&request.host_key());
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };

        self.hooks.fire_request(&request);

        let allowed = self.config.ignore_robots_txt
            || self
                .robots
                .is_allowed(self.transport.as_ref(), &request.url, &self.config.user_agent)
                .await;

        if allowed {
            self.execute(request).await;
        } else {
            let message = EngineError::RobotsDenied(request.url.to_string()).to_string();
            tracing::debug!(url = %request.url, "Blocked by robots.txt");
            self.hooks
                .fire_error(&FetchFailure::transport(request, message));
        }

        let pause = self.politeness_delay();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    async fn execute(&self, request: FetchRequest) {
        let cached = match &self.cache {
            Some(cache) => cache.get(&request).await,
            None => None,
        };
        let from_cache = cached.is_some();

        let outcome = match cached {
            Some(raw) => Ok(raw),
            None => self.transport.send(&request).await,
        };

        match outcome {
            Ok(raw) if raw.is_success() => {
                if let (Some(cache), false) = (&self.cache, from_cache) {
                    cache.put(&request, &raw).await;
                }

                let response = FetchResponse::from_raw(request, raw);
                self.hooks.fire_response(&response);
                if response.is_html() && self.hooks.has_html_handlers() {
                    self.hooks.run_html(&response);
                }
            }
            Ok(raw) => {
                self.hooks.fire_error(&FetchFailure::from_raw(request, raw));
            }
            Err(e) => {
                self.hooks
                    .fire_error(&FetchFailure::transport(request, e.to_string()));
            }
        }
    }

    fn politeness_delay(&self) -> Duration {
        let jitter_ms = self.config.random_delay_ms;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        self.config.delay() + jitter
    }
}
