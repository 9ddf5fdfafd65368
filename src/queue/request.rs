use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header map as stored in snapshots: one name, possibly several values
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Per-request context carried through the fetch engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Number of retries already spent on this request
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,

    /// Persisted task backing this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Caller-supplied string pairs
    #[serde(flatten)]
    pub custom: BTreeMap<String, String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl RequestContext {
    pub fn is_empty(&self) -> bool {
        self.retry_count == 0 && self.task_id.is_none() && self.custom.is_empty()
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets a custom pair
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.custom.get(key).map(String::as_str)
    }
}

/// A queued fetch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,

    #[serde(default)]
    pub method: String,

    /// Lower values are popped first
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub depth: u32,

    /// Submission time; filled in when the request is queued
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMap>,

    #[serde(default, skip_serializing_if = "RequestContext::is_empty")]
    pub ctx: RequestContext,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: String::new(),
            priority: 0,
            depth: 0,
            timestamp: None,
            headers: None,
            ctx: RequestContext::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_ctx(mut self, ctx: RequestContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Adds one header value, keeping earlier values for the same name
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Fills in the defaults applied on insertion
    pub(crate) fn apply_defaults(&mut self, now: DateTime<Utc>) {
        if self.method.is_empty() {
            self.method = "GET".to_string();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }
}
