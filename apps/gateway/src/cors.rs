use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::debug;

const DEFAULT_ORIGINS: [&str; 9] = [
    "http://localhost:3000",
    "https://localhost:3000",
    "http://localhost:3001",
    "https://localhost:3001",
    "https://formserver.energenie.io",
    "https://formserver.energenie.io*",
    "https://seetech.energenie.io",
    "https://seetech.energenie.io*",
    "http://seetech.energenie.io",
];

/// Browser origins allowed to call the API.
///
/// Entries ending in `*` match by prefix. Any origin mentioning `localhost` is always allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::from_entries(DEFAULT_ORIGINS)
    }
}

impl CorsPolicy {
    /// Parses a comma-separated origin list.
    pub fn parse(raw: &str) -> Self {
        Self::from_entries(raw.split(','))
    }

    fn from_entries<'a, I: IntoIterator<Item = &'a str>>(entries: I) -> Self {
        let mut policy = Self {
            exact: Vec::new(),
            prefixes: Vec::new(),
        };
        for entry in entries.into_iter().map(str::trim).filter(|e| !e.is_empty()) {
            match entry.strip_suffix('*') {
                Some(prefix) => policy.prefixes.push(prefix.to_string()),
                None => policy.exact.push(entry.trim_end_matches('/').to_string()),
            }
        }
        policy
    }

    pub fn allows(&self, origin: &str) -> bool {
        origin.contains("localhost")
            || self.exact.iter().any(|allowed| allowed == origin)
            || self.prefixes.iter().any(|prefix| origin.starts_with(prefix.as_str()))
    }

    pub fn layer(&self) -> CorsLayer {
        let policy = Arc::new(self.clone());
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                let allowed = origin.to_str().is_ok_and(|o| policy.allows(o));
                if !allowed {
                    debug!(origin = ?origin, "origin blocked");
                }
                allowed
            }))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("x-requested-with"),
                header::ACCEPT,
                header::ORIGIN,
            ])
            .allow_credentials(true)
            .max_age(Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_known_frontends() {
        let policy = CorsPolicy::default();
        assert!(policy.allows("https://formserver.energenie.io"));
        assert!(policy.allows("https://seetech.energenie.io.eu-west.example"));
        assert!(policy.allows("http://localhost:5173"));
        assert!(!policy.allows("https://evil.example.com"));
        assert!(!policy.allows("http://formserver.energenie.io"));
    }

    #[test]
    fn parsed_entries_support_prefixes() {
        let policy = CorsPolicy::parse(" https://crm.example.com/ , https://*, ");
        assert!(policy.allows("https://crm.example.com"));
        assert!(policy.allows("https://anything.example"));
        assert!(!policy.allows("http://crm.example.com"));
    }
}
