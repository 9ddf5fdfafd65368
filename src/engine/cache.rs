//! On-disk response cache
//!
//! Successful GET responses are stored as two files named by the SHA-256 of
//! the URL: `<hash>.body` holds the payload, `<hash>.json` the status and
//! headers. Read and write failures are treated as cache misses.

use crate::engine::request::{FetchRequest, RawResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    status: u16,
    headers: BTreeMap<String, Vec<String>>,
}

/// Response cache rooted at a directory
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, request: &FetchRequest) -> (PathBuf, PathBuf) {
        let mut hasher = Sha256::new();
        hasher.update(request.url.as_str().as_bytes());
        let key = hex::encode(hasher.finalize());
        (
            self.dir.join(format!("{}.body", key)),
            self.dir.join(format!("{}.json", key)),
        )
    }

    /// Only GET requests are cacheable
    pub fn accepts(request: &FetchRequest) -> bool {
        request.method == Method::GET
    }

    pub async fn get(&self, request: &FetchRequest) -> Option<RawResponse> {
        if !Self::accepts(request) {
            return None;
        }

        let (body_path, meta_path) = self.paths(request);
        let meta = tokio::fs::read(&meta_path).await.ok()?;
        let meta: CacheMeta = serde_json::from_slice(&meta).ok()?;
        let body = tokio::fs::read(&body_path).await.ok()?;

        let mut headers = HeaderMap::new();
        for (name, values) in &meta.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }

        tracing::debug!(url = %request.url, "Serving response from cache");
        Some(RawResponse {
            status: meta.status,
            headers,
            body,
        })
    }

    /// Stores a 200 response for a GET request
    pub async fn put(&self, request: &FetchRequest, response: &RawResponse) {
        if !Self::accepts(request) || response.status != 200 {
            return;
        }

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &response.headers {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let meta = CacheMeta {
            status: response.status,
            headers,
        };

        if let Err(e) = self.write(request, &meta, &response.body).await {
            tracing::debug!(url = %request.url, error = %e, "Failed to cache response");
        }
    }

    async fn write(&self, request: &FetchRequest, meta: &CacheMeta, body: &[u8]) -> std::io::Result<()> {
        let (body_path, meta_path) = self.paths(request);
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&body_path, body).await?;
        let meta = serde_json::to_vec(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // Metadata last: a body without metadata is a miss
        tokio::fs::write(&meta_path, meta).await?;
        Ok(())
    }
}
