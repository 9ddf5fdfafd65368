//! Robots.txt checks
//!
//! Rules are fetched once per host through the engine's transport and kept for
//! the lifetime of the engine.

use crate::engine::request::FetchRequest;
use crate::engine::transport::Transport;
use robotstxt::DefaultMatcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

/// Parsed robots.txt rules for one host
#[derive(Debug, Clone)]
pub struct ParsedRobots {
    /// Raw robots.txt content (empty means allow all)
    content: String,
}

impl ParsedRobots {
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }

    /// Permissive rules used when a host has no usable robots.txt
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
        }
    }

    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        if self.content.is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, user_agent, url)
    }
}

/// Per-host cache of robots.txt rules
#[derive(Default)]
pub struct RobotsCache {
    entries: Mutex<HashMap<String, Arc<ParsedRobots>>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, origin: &str) -> Option<Arc<ParsedRobots>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned()
    }

    /// Checks `url` against its host's rules, fetching them on first use
    ///
    /// A missing, unreadable or unreachable robots.txt allows everything.
    pub async fn is_allowed(&self, transport: &dyn Transport, url: &Url, user_agent: &str) -> bool {
        let origin = url.origin().ascii_serialization();

        let rules = match self.cached(&origin) {
            Some(rules) => rules,
            None => {
                let rules = Arc::new(fetch_rules(transport, url, user_agent).await);
                self.entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(origin)
                    .or_insert(rules)
                    .clone()
            }
        };

        rules.is_allowed(url.as_str(), user_agent)
    }
}

async fn fetch_rules(transport: &dyn Transport, url: &Url, user_agent: &str) -> ParsedRobots {
    let robots_url = match url.join("/robots.txt") {
        Ok(robots_url) => robots_url,
        Err(_) => return ParsedRobots::allow_all(),
    };

    let mut request = FetchRequest::new(robots_url.clone());
    if let Ok(value) = reqwest::header::HeaderValue::from_str(user_agent) {
        request.headers.insert(reqwest::header::USER_AGENT, value);
    }

    match transport.send(&request).await {
        Ok(raw) if raw.is_success() => {
            tracing::debug!(url = %robots_url, "Fetched robots.txt");
            ParsedRobots::from_content(&String::from_utf8_lossy(&raw.body))
        }
        Ok(raw) => {
            tracing::debug!(url = %robots_url, status = raw.status, "No robots.txt, allowing all");
            ParsedRobots::allow_all()
        }
        Err(e) => {
            tracing::warn!(url = %robots_url, error = %e, "Failed to fetch robots.txt, allowing all");
            ParsedRobots::allow_all()
        }
    }
}
