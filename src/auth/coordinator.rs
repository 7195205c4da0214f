/// Challenge coordinator: turns a credential request into a credential
/// Refresh, then the server's strategy, then the web-view fallback when OAuth is intercepted
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::context::AuthContext;
use super::cookies::CookieBridge;
use super::oauth::{AuthorizationCodeFlow, AuthorizationStrategy};
use super::webview::{FallbackStrategy, WebViewLogin, WebViewNavigator};
use crate::error::{AuthError, Result};
use crate::types::{
    AuthenticationType, Credential, CredentialMaterial, CredentialRequest, Scheme, ServerConfig,
    TriggeringError,
};

type SharedNegotiation = Shared<BoxFuture<'static, Result<Credential>>>;

/// In-flight negotiations, one per server and requested authentication type.
type InFlight = Arc<Mutex<HashMap<(String, AuthenticationType), SharedNegotiation>>>;

/// Where the most recent negotiation for a server stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Refreshing,
    OAuthAttempt,
    Intercepted,
    FallbackAttempt,
    Succeeded,
    Failed,
    Canceled,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Succeeded | NegotiationState::Failed | NegotiationState::Canceled
        )
    }

    pub fn can_transition_to(&self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Idle | Succeeded | Failed | Canceled, Refreshing | OAuthAttempt | FallbackAttempt) => {
                true
            }
            (Refreshing, Succeeded | OAuthAttempt | FallbackAttempt | Failed | Canceled) => true,
            (OAuthAttempt, Succeeded | Intercepted | Failed | Canceled) => true,
            (Intercepted, FallbackAttempt) => true,
            (FallbackAttempt, Succeeded | Failed | Canceled) => true,
            _ => false,
        }
    }
}

enum Cached {
    Fresh(Credential),
    Stale(Credential),
    Missing,
}

pub struct ChallengeCoordinator {
    ctx: Arc<AuthContext>,
    oauth: Arc<dyn AuthorizationStrategy>,
    fallback: Arc<dyn FallbackStrategy>,
    in_flight: InFlight,
    states: Arc<RwLock<HashMap<String, NegotiationState>>>,
}

impl ChallengeCoordinator {
    /// Coordinator with the built-in strategies, both driving `navigator`.
    pub fn new(ctx: Arc<AuthContext>, navigator: Arc<dyn WebViewNavigator>) -> Self {
        let oauth = Arc::new(AuthorizationCodeFlow::new(ctx.clone(), navigator.clone()));
        let fallback = Arc::new(WebViewLogin::new(navigator, ctx.max_webview_redirects()));
        Self::with_strategies(ctx, oauth, fallback)
    }

    pub fn with_strategies(
        ctx: Arc<AuthContext>,
        oauth: Arc<dyn AuthorizationStrategy>,
        fallback: Arc<dyn FallbackStrategy>,
    ) -> Self {
        Self {
            ctx,
            oauth,
            fallback,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Arc<AuthContext> {
        &self.ctx
    }

    pub async fn resolve(&self, request: CredentialRequest) -> Result<Credential> {
        self.resolve_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Resolves a credential for `request.target_uri`.
    ///
    /// When another call is already negotiating for the same server this call
    /// waits for that outcome instead of starting a second negotiation. Firing
    /// `cancel` then only detaches this caller; the token of the caller that
    /// started the negotiation cancels it for everyone.
    pub async fn resolve_with_cancel(
        &self,
        request: CredentialRequest,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        let server = self
            .ctx
            .registry()
            .lookup(&request.target_uri)
            .ok_or_else(|| AuthError::UnknownServer(request.target_uri.clone()))?;
        let auth_type = request
            .options
            .authentication_type
            .unwrap_or(server.authentication_type);

        if let Cached::Fresh(credential) = self.cached(&server, auth_type) {
            debug!(server = %server.base_uri, scheme = %credential.scheme(), "using cached credential");
            return Ok(credential);
        }

        let negotiation = {
            let mut in_flight = self.in_flight.lock();
            let key = (server.base_uri.clone(), auth_type);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(server = %server.base_uri, "joining in-flight negotiation");
                    crate::metrics::METRICS.negotiations_joined_total.inc();
                    existing.clone()
                }
                None => {
                    // A negotiation may have finished since the first check
                    let stale = match self.cached(&server, auth_type) {
                        Cached::Fresh(credential) => return Ok(credential),
                        Cached::Stale(credential) => Some(credential),
                        Cached::Missing => None,
                    };
                    let negotiation = self.start(server, auth_type, &request, stale, cancel);
                    in_flight.insert(key, negotiation.clone());
                    negotiation
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            result = negotiation => result,
        }
    }

    /// State of the latest negotiation for the server covering `uri`.
    pub fn state(&self, uri: &str) -> NegotiationState {
        let Some(server) = self.ctx.registry().lookup(uri) else {
            return NegotiationState::Idle;
        };
        self.states
            .read()
            .get(&server.base_uri)
            .copied()
            .unwrap_or(NegotiationState::Idle)
    }

    /// Drops every credential held for the server covering `uri` and expires
    /// its session cookies. Returns how many credentials were removed.
    pub async fn logout(&self, uri: &str) -> Result<usize> {
        let server = self
            .ctx
            .registry()
            .lookup(uri)
            .ok_or_else(|| AuthError::UnknownServer(uri.to_string()))?;
        let store = self.ctx.store();
        let credentials = store.credentials_for(&server.base_uri);

        for credential in &credentials {
            if let CredentialMaterial::CookieSession {
                domain,
                cookie_names,
            } = credential.material()
            {
                CookieBridge::revoke(domain, cookie_names, self.ctx.cookie_jar())?;
            }
        }
        for scheme in Scheme::ALL {
            store.invalidate(&server.base_uri, scheme);
        }
        self.states.write().remove(&server.base_uri);

        info!(server = %server.base_uri, removed = credentials.len(), "logged out");
        Ok(credentials.len())
    }

    fn cached(&self, server: &ServerConfig, auth_type: AuthenticationType) -> Cached {
        let store = self.ctx.store();
        if let Some(session) = store.get(&server.base_uri, Scheme::CookieSession) {
            return Cached::Fresh(session);
        }

        match store.get(&server.base_uri, auth_type.scheme()) {
            Some(credential) if !credential.is_expired(self.ctx.expiry_buffer()) => {
                Cached::Fresh(credential)
            }
            Some(credential) if credential.refresh_token().is_some() => Cached::Stale(credential),
            _ => Cached::Missing,
        }
    }

    fn start(
        &self,
        server: ServerConfig,
        auth_type: AuthenticationType,
        request: &CredentialRequest,
        stale: Option<Credential>,
        cancel: &CancellationToken,
    ) -> SharedNegotiation {
        let span = info_span!(
            "negotiation",
            id = %Uuid::new_v4(),
            server = %server.base_uri,
            auth = %auth_type,
        );
        let negotiation = Negotiation {
            ctx: self.ctx.clone(),
            oauth: self.oauth.clone(),
            fallback: self.fallback.clone(),
            in_flight: self.in_flight.clone(),
            states: self.states.clone(),
            server,
            auth_type,
            force_fallback: request.triggering_error == Some(TriggeringError::Intercepted),
            stale,
            cancel: cancel.clone(),
        };

        let handle = tokio::spawn(negotiation.run().instrument(span));
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(AuthError::auth_failed(format!("negotiation task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }
}

/// One negotiation for one server, run on its own task.
struct Negotiation {
    ctx: Arc<AuthContext>,
    oauth: Arc<dyn AuthorizationStrategy>,
    fallback: Arc<dyn FallbackStrategy>,
    in_flight: InFlight,
    states: Arc<RwLock<HashMap<String, NegotiationState>>>,
    server: ServerConfig,
    auth_type: AuthenticationType,
    force_fallback: bool,
    stale: Option<Credential>,
    cancel: CancellationToken,
}

impl Negotiation {
    async fn run(self) -> Result<Credential> {
        let started = Instant::now();
        let result = self.negotiate().await;

        let (outcome, state) = match &result {
            Ok(_) => ("succeeded", NegotiationState::Succeeded),
            Err(AuthError::Canceled) => ("canceled", NegotiationState::Canceled),
            Err(_) => ("failed", NegotiationState::Failed),
        };
        self.transition(state);

        let metrics = &crate::metrics::METRICS;
        metrics.negotiations_total.with_label_values(&[outcome]).inc();
        metrics
            .negotiation_duration_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(credential) => info!(scheme = %credential.scheme(), "negotiation succeeded"),
            Err(AuthError::Canceled) => debug!("negotiation canceled"),
            Err(e) => warn!("Negotiation failed: {}", e),
        }

        // Store writes above happen before waiters can start a new negotiation
        self.in_flight
            .lock()
            .remove(&(self.server.base_uri.clone(), self.auth_type));
        result
    }

    async fn negotiate(&self) -> Result<Credential> {
        if let Some(stale) = &self.stale {
            self.transition(NegotiationState::Refreshing);
            match self.oauth.refresh(&self.server, stale, &self.cancel).await {
                Ok(credential) => return self.keep(credential),
                Err(AuthError::Canceled) => return Err(AuthError::Canceled),
                // The stale entry stays until a new credential replaces it
                Err(e) => warn!("Token refresh failed, re-authenticating: {}", e),
            }
        }

        if self.force_fallback {
            debug!("request was intercepted, going straight to web-view login");
            return self.fall_back().await;
        }

        let attempt = match self.auth_type {
            AuthenticationType::Token => return self.fall_back().await,
            AuthenticationType::OAuthAuthorizationCode => {
                self.transition(NegotiationState::OAuthAttempt);
                self.oauth.authorize(&self.server, &self.cancel).await
            }
            AuthenticationType::OAuthClientCredentials => {
                self.transition(NegotiationState::OAuthAttempt);
                self.oauth.client_credentials(&self.server, &self.cancel).await
            }
        };

        match attempt {
            Ok(credential) => self.keep(credential),
            Err(AuthError::Intercepted(reason)) => {
                info!(reason = %reason, "OAuth flow intercepted, falling back to web-view login");
                self.transition(NegotiationState::Intercepted);
                self.fall_back().await
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the web-view login once and routes the server through the
    /// resulting cookie session.
    async fn fall_back(&self) -> Result<Credential> {
        self.transition(NegotiationState::FallbackAttempt);

        let cookies = match self
            .fallback
            .login_via_webview(&self.server, &self.cancel)
            .await
        {
            Ok(cookies) => cookies,
            Err(AuthError::Intercepted(reason)) => {
                return Err(AuthError::auth_failed(format!(
                    "web-view login intercepted: {}",
                    reason
                )));
            }
            Err(e) => return Err(e),
        };
        if self.cancel.is_cancelled() {
            return Err(AuthError::Canceled);
        }

        CookieBridge::apply(&cookies, self.ctx.cookie_jar())?;
        let session = Credential::cookie_session(self.server.base_uri.clone(), &cookies);
        self.ctx
            .store()
            .replace_session(&self.server.base_uri, session.clone());
        Ok(session)
    }

    fn keep(&self, credential: Credential) -> Result<Credential> {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Canceled);
        }
        self.ctx
            .store()
            .put(&self.server.base_uri, credential.scheme(), credential.clone());
        Ok(credential)
    }

    fn transition(&self, next: NegotiationState) {
        let mut states = self.states.write();
        let current = states
            .get(&self.server.base_uri)
            .copied()
            .unwrap_or(NegotiationState::Idle);
        if !current.can_transition_to(next) {
            warn!(from = ?current, to = ?next, "unexpected negotiation state transition");
        }
        debug!(from = ?current, to = ?next, "negotiation state");
        states.insert(self.server.base_uri.clone(), next);
    }
}
