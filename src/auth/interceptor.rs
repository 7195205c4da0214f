/// Detects responses produced by an intermediary instead of the authorization server
/// (e.g. an F5 BIG-IP front end answering with its own login page)
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, Result};

/// Flags a response whose `header` contains `contains` (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptRule {
    pub header: String,
    pub contains: String,
}

impl InterceptRule {
    pub fn new(header: impl Into<String>, contains: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            contains: contains.into(),
        }
    }
}

impl Default for InterceptRule {
    fn default() -> Self {
        Self::new("Server", "BigIP")
    }
}

/// Outcome of inspecting one response. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptSignal {
    pub intercepted: bool,
    pub uri: String,
    pub reason: Option<String>,
}

impl InterceptSignal {
    fn clear(uri: &Url) -> Self {
        Self {
            intercepted: false,
            uri: uri.to_string(),
            reason: None,
        }
    }

    /// `Err(Intercepted)` for a positive signal.
    pub fn into_result(self) -> Result<()> {
        if self.intercepted {
            crate::metrics::METRICS.interceptions_total.inc();
            Err(AuthError::Intercepted(format!(
                "{} ({})",
                self.uri,
                self.reason.unwrap_or_else(|| "intermediary response".to_string())
            )))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInterceptor {
    rules: Vec<InterceptRule>,
}

impl Default for ResponseInterceptor {
    fn default() -> Self {
        Self::new(vec![InterceptRule::default()])
    }
}

impl ResponseInterceptor {
    pub fn new(rules: Vec<InterceptRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[InterceptRule] {
        &self.rules
    }

    pub fn inspect(&self, uri: &Url, headers: &HeaderMap) -> InterceptSignal {
        for rule in &self.rules {
            let needle = rule.contains.to_ascii_lowercase();
            let hit = headers
                .get_all(rule.header.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find(|value| value.to_ascii_lowercase().contains(&needle));

            if let Some(value) = hit {
                return InterceptSignal {
                    intercepted: true,
                    uri: uri.to_string(),
                    reason: Some(format!("{}: {}", rule.header, value)),
                };
            }
        }
        InterceptSignal::clear(uri)
    }

    pub fn inspect_response(&self, response: &reqwest::Response) -> InterceptSignal {
        self.inspect(response.url(), response.headers())
    }
}
