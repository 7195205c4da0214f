/// Injectable authentication context: everything negotiation reads or mutates
use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::interceptor::ResponseInterceptor;
use super::persistence::CredentialPersistence;
use super::registry::ServerRegistry;
use super::store::CredentialStore;
use crate::error::{AuthError, Result};

const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 300;
const DEFAULT_MAX_WEBVIEW_REDIRECTS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct AuthContext {
    store: CredentialStore,
    registry: ServerRegistry,
    interceptor: ResponseInterceptor,
    cookie_jar: Arc<Jar>,
    http: reqwest::Client,
    oauth_http: reqwest::Client,
    expiry_buffer: chrono::Duration,
    max_webview_redirects: usize,
}

impl AuthContext {
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> AuthContextBuilder {
        AuthContextBuilder::default()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn interceptor(&self) -> &ResponseInterceptor {
        &self.interceptor
    }

    /// Jar shared by both HTTP clients; the cookie bridge writes here.
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.cookie_jar
    }

    /// Client for protected requests. Follows redirects and carries the jar.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Client for authorization and token endpoints. Never follows redirects
    /// so the interceptor sees whoever answered first.
    pub fn oauth_http(&self) -> &reqwest::Client {
        &self.oauth_http
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        self.expiry_buffer
    }

    pub fn max_webview_redirects(&self) -> usize {
        self.max_webview_redirects
    }
}

// Counts only; credentials and cookies never reach a log line
impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("servers", &self.registry.len())
            .field("credentials", &self.store.len())
            .field("expiry_buffer_secs", &self.expiry_buffer.num_seconds())
            .field("max_webview_redirects", &self.max_webview_redirects)
            .finish_non_exhaustive()
    }
}

pub struct AuthContextBuilder {
    interceptor: ResponseInterceptor,
    persistence: Option<Arc<dyn CredentialPersistence>>,
    expiry_buffer_secs: u64,
    max_webview_redirects: usize,
    request_timeout: Duration,
}

impl Default for AuthContextBuilder {
    fn default() -> Self {
        Self {
            interceptor: ResponseInterceptor::default(),
            persistence: None,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            max_webview_redirects: DEFAULT_MAX_WEBVIEW_REDIRECTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl AuthContextBuilder {
    pub fn interceptor(mut self, interceptor: ResponseInterceptor) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn CredentialPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn expiry_buffer_secs(mut self, secs: u64) -> Self {
        self.expiry_buffer_secs = secs;
        self
    }

    pub fn max_webview_redirects(mut self, max: usize) -> Self {
        self.max_webview_redirects = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<AuthContext> {
        let cookie_jar = Arc::new(Jar::default());
        let user_agent = format!("portal-auth/{}", crate::VERSION);

        let http = reqwest::Client::builder()
            .cookie_provider(cookie_jar.clone())
            .user_agent(user_agent.clone())
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| AuthError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;

        let oauth_http = reqwest::Client::builder()
            .cookie_provider(cookie_jar.clone())
            .user_agent(user_agent)
            .redirect(Policy::none())
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| AuthError::InvalidConfig(format!("cannot build OAuth client: {}", e)))?;

        let expiry_buffer = i64::try_from(self.expiry_buffer_secs)
            .map(chrono::Duration::seconds)
            .map_err(|_| AuthError::InvalidConfig("expiry buffer out of range".to_string()))?;

        let store = match self.persistence {
            Some(persistence) => CredentialStore::with_persistence(persistence),
            None => CredentialStore::new(),
        };

        Ok(AuthContext {
            store,
            registry: ServerRegistry::new(),
            interceptor: self.interceptor,
            cookie_jar,
            http,
            oauth_http,
            expiry_buffer,
            max_webview_redirects: self.max_webview_redirects,
        })
    }
}
