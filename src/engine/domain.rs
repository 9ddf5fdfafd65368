//! Domain allow/deny matching
//!
//! Patterns are either exact hosts (`example.com`) or wildcards
//! (`*.example.com`), where a wildcard also matches the bare domain.

use url::Url;

/// Extracts the lowercase host from a URL
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Checks if a domain matches a wildcard pattern
///
/// ```
/// use crawl_conductor::engine::matches_wildcard;
///
/// assert!(matches_wildcard("example.com", "example.com"));
/// assert!(matches_wildcard("*.example.com", "example.com"));
/// assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
/// assert!(!matches_wildcard("*.example.com", "myexample.com"));
/// ```
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || candidate
                    .strip_suffix(base)
                    .map_or(false, |rest| rest.ends_with('.'))
        }
        None => candidate == pattern,
    }
}

/// Validates a domain pattern (supports a leading `*.` wildcard)
pub fn validate_domain_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("Domain pattern cannot be empty".to_string());
    }

    let domain = pattern.strip_prefix("*.").unwrap_or(pattern);
    if domain.is_empty() {
        return Err(format!("Domain pattern '{}' has no base domain", pattern));
    }

    if !domain
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("Domain '{}' contains invalid characters", domain));
    }

    if domain.starts_with(['.', '-']) || domain.ends_with(['.', '-']) {
        return Err(format!(
            "Domain '{}' cannot start or end with '.' or '-'",
            domain
        ));
    }

    Ok(())
}

/// Allow and deny lists applied to every request host
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    allowed: Vec<String>,
    disallowed: Vec<String>,
}

impl DomainFilter {
    pub fn new(allowed: &[String], disallowed: &[String]) -> Self {
        let lower = |patterns: &[String]| patterns.iter().map(|p| p.to_lowercase()).collect();
        Self {
            allowed: lower(allowed),
            disallowed: lower(disallowed),
        }
    }

    /// A host passes when it matches no deny pattern and, if an allow list
    /// is configured, at least one allow pattern
    pub fn permits(&self, domain: &str) -> bool {
        if self.disallowed.iter().any(|p| matches_wildcard(p, domain)) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|p| matches_wildcard(p, domain))
    }
}
