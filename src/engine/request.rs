use crate::engine::EngineError;
use crate::queue::{self, RequestContext};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use url::Url;

/// A request handed to the fetch engine
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub depth: u32,
    pub priority: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub ctx: RequestContext,
}

impl FetchRequest {
    /// Creates a GET request at depth 1
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            depth: 1,
            priority: 0,
            timestamp: None,
            ctx: RequestContext::default(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, EngineError> {
        let url = Url::parse(url).map_err(|e| EngineError::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self::new(url))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_ctx(mut self, ctx: RequestContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Key used by the revisit check: MD5 over method and URL
    pub fn revisit_key(&self) -> String {
        format!(
            "{:x}",
            md5::compute(format!("{}{}", self.method, self.url).as_bytes())
        )
    }

    /// `host:port` used to group requests for parallelism limits
    pub fn host_key(&self) -> String {
        let host = self.url.host_str().unwrap_or_default().to_lowercase();
        match self.url.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

/// Converts snapshot-style headers into a transport header map
pub fn header_map(headers: &queue::HeaderMap) -> Result<HeaderMap, EngineError> {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EngineError::InvalidHeader(format!("{}: {}", name, e)))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::InvalidHeader(format!("{}: {}", name, e)))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

/// What a transport returns for one exchange
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub request: FetchRequest,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub(crate) fn from_raw(request: FetchRequest, raw: RawResponse) -> Self {
        Self {
            request,
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
        }
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    pub fn is_html(&self) -> bool {
        self.content_type().to_ascii_lowercase().contains("text/html")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A failed fetch: non-2xx status, robots denial, or transport error
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub request: FetchRequest,
    /// HTTP status, or 0 when no response was received
    pub status: u16,
    pub message: String,
    pub body: Vec<u8>,
}

impl FetchFailure {
    pub fn transport(request: FetchRequest, message: impl Into<String>) -> Self {
        Self {
            request,
            status: 0,
            message: message.into(),
            body: Vec::new(),
        }
    }

    pub(crate) fn from_raw(request: FetchRequest, raw: RawResponse) -> Self {
        let message = StatusCode::from_u16(raw.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP status {}", raw.status));

        Self {
            request,
            status: raw.status,
            message,
            body: raw.body,
        }
    }
}
