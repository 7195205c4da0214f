/// Interactive web-view login used when an intermediary blocks the OAuth flow
/// Once the view reaches the portal home page its cookies are the session
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthError, Result};
use crate::types::{Cookie, CookieSet, ServerConfig};

/// The only UI capability the core needs.
#[async_trait]
pub trait WebViewNavigator: Send + Sync {
    /// Shows the view (if hidden) and starts loading `uri`.
    async fn navigate(&self, uri: &Url) -> Result<()>;

    /// Waits for the next completed navigation. `None` means the user
    /// dismissed the view.
    async fn next_navigation(&self) -> Option<Url>;

    /// Cookies the view currently holds for `domain`.
    async fn cookies(&self, domain: &str) -> Result<Vec<Cookie>>;

    /// Tears the view down. A later `navigate` opens a new one.
    async fn close(&self) {}
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    async fn login_via_webview(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<CookieSet>;
}

pub struct WebViewLogin {
    navigator: Arc<dyn WebViewNavigator>,
    max_redirects: usize,
}

impl WebViewLogin {
    pub fn new(navigator: Arc<dyn WebViewNavigator>, max_redirects: usize) -> Self {
        Self {
            navigator,
            max_redirects,
        }
    }

    async fn drive(&self, home: &Url) -> Result<CookieSet> {
        self.navigator.navigate(home).await?;

        let mut hops = 0usize;
        loop {
            let Some(landed) = self.navigator.next_navigation().await else {
                debug!("web-view dismissed before reaching home");
                return Err(AuthError::Canceled);
            };

            if same_page(&landed, home) {
                debug!(hops, "web-view reached home");
                break;
            }

            hops += 1;
            debug!(hops, uri = %redact(&landed), "web-view navigated");
            if hops > self.max_redirects {
                return Err(AuthError::auth_failed(format!(
                    "login did not reach {} within {} navigations",
                    home, self.max_redirects
                )));
            }
        }

        let domain = home
            .host_str()
            .ok_or_else(|| AuthError::InvalidConfig(format!("home URI {} has no host", home)))?;
        let cookies = self.navigator.cookies(domain).await?;
        if cookies.is_empty() {
            return Err(AuthError::auth_failed(format!(
                "login reached {} but no session cookies were set",
                home
            )));
        }

        Ok(CookieSet::new(domain, cookies))
    }
}

#[async_trait]
impl FallbackStrategy for WebViewLogin {
    async fn login_via_webview(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<CookieSet> {
        let home = server.home_url()?;
        info!(home = %home, "starting web-view login");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            result = self.drive(&home) => result,
        };

        // No UI state outlives the call
        self.navigator.close().await;

        let outcome = match &result {
            Ok(_) => "succeeded",
            Err(e) => e.kind(),
        };
        crate::metrics::METRICS
            .fallback_logins_total
            .with_label_values(&[outcome])
            .inc();
        match &result {
            Err(e) if !e.is_canceled() => warn!("Web-view login failed: {}", e),
            _ => {}
        }
        result
    }
}

/// Same scheme, host, port and path; query, fragment and a trailing slash
/// are ignored.
pub(crate) fn same_page(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
        && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
}

// Login pages carry tickets in the query string; log origin and path only.
pub(crate) fn redact(uri: &Url) -> String {
    format!("{}{}", uri.origin().ascii_serialization(), uri.path())
}
