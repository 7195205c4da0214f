use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AuthError;

/// How a registered server expects clients to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticationType {
    Token,
    OAuthAuthorizationCode,
    OAuthClientCredentials,
}

impl AuthenticationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationType::Token => "token",
            AuthenticationType::OAuthAuthorizationCode => "OAuthAuthorizationCode",
            AuthenticationType::OAuthClientCredentials => "OAuthClientCredentials",
        }
    }

    /// Scheme a successful negotiation of this type is stored under.
    pub fn scheme(&self) -> Scheme {
        match self {
            AuthenticationType::Token => Scheme::Token,
            AuthenticationType::OAuthAuthorizationCode => Scheme::OAuthAuthorizationCode,
            AuthenticationType::OAuthClientCredentials => Scheme::OAuthClientCredentials,
        }
    }

    pub fn is_oauth(&self) -> bool {
        !matches!(self, AuthenticationType::Token)
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "token" => Ok(AuthenticationType::Token),
            "oauthauthorizationcode" => Ok(AuthenticationType::OAuthAuthorizationCode),
            "oauthclientcredentials" => Ok(AuthenticationType::OAuthClientCredentials),
            _ => Err(AuthError::InvalidConfig(format!(
                "unrecognized authentication type '{}' (expected token, OAuthAuthorizationCode or OAuthClientCredentials)",
                s
            ))),
        }
    }
}

/// Key under which a credential lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Token,
    OAuthAuthorizationCode,
    OAuthClientCredentials,
    /// Session cookies harvested by the web-view fallback login.
    CookieSession,
}

impl Scheme {
    pub const ALL: [Scheme; 4] = [
        Scheme::Token,
        Scheme::OAuthAuthorizationCode,
        Scheme::OAuthClientCredentials,
        Scheme::CookieSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Token => "token",
            Scheme::OAuthAuthorizationCode => "oauth_authorization_code",
            Scheme::OAuthClientCredentials => "oauth_client_credentials",
            Scheme::CookieSession => "cookie_session",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication settings for one server, keyed by its base URI.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_uri: String,
    pub authentication_type: AuthenticationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Page the fallback login must land on to count as signed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ServerConfig {
    pub fn new(base_uri: impl Into<String>, authentication_type: AuthenticationType) -> Self {
        Self {
            base_uri: base_uri.into(),
            authentication_type,
            oauth_client_id: None,
            oauth_redirect_uri: None,
            client_secret: None,
            home_uri: None,
            authorize_uri: None,
            token_uri: None,
            scopes: Vec::new(),
        }
    }

    pub fn with_oauth_client(
        mut self,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        self.oauth_client_id = Some(client_id.into());
        self.oauth_redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_home_uri(mut self, uri: impl Into<String>) -> Self {
        self.home_uri = Some(uri.into());
        self
    }

    pub fn with_authorize_uri(mut self, uri: impl Into<String>) -> Self {
        self.authorize_uri = Some(uri.into());
        self
    }

    pub fn with_token_uri(mut self, uri: impl Into<String>) -> Self {
        self.token_uri = Some(uri.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    fn base(&self) -> &str {
        self.base_uri.trim_end_matches('/')
    }

    pub fn home_uri(&self) -> String {
        self.home_uri
            .clone()
            .unwrap_or_else(|| format!("{}/home", self.base()))
    }

    pub fn authorize_uri(&self) -> String {
        self.authorize_uri
            .clone()
            .unwrap_or_else(|| format!("{}/sharing/oauth2/authorize", self.base()))
    }

    pub fn token_uri(&self) -> String {
        self.token_uri
            .clone()
            .unwrap_or_else(|| format!("{}/sharing/oauth2/token", self.base()))
    }

    pub fn home_url(&self) -> Result<url::Url, AuthError> {
        let home = self.home_uri();
        url::Url::parse(&home)
            .map_err(|e| AuthError::InvalidConfig(format!("invalid home URI '{}': {}", home, e)))
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("base_uri", &self.base_uri)
            .field("authentication_type", &self.authentication_type)
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_redirect_uri", &self.oauth_redirect_uri)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("home_uri", &self.home_uri)
            .field("authorize_uri", &self.authorize_uri)
            .field("token_uri", &self.token_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Desired token type for a credential request; `None` uses the server's
/// registered type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateTokenOptions {
    pub authentication_type: Option<AuthenticationType>,
}

/// What made a protected request fail and re-enter negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggeringError {
    Unauthorized,
    Forbidden,
    /// A proxy answered the request itself; OAuth is known to be unusable.
    Intercepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub target_uri: String,
    pub options: GenerateTokenOptions,
    pub triggering_error: Option<TriggeringError>,
}

impl CredentialRequest {
    pub fn new(target_uri: impl Into<String>) -> Self {
        Self {
            target_uri: target_uri.into(),
            options: GenerateTokenOptions::default(),
            triggering_error: None,
        }
    }

    pub fn with_authentication_type(mut self, authentication_type: AuthenticationType) -> Self {
        self.options.authentication_type = Some(authentication_type);
        self
    }

    pub fn with_triggering_error(mut self, error: TriggeringError) -> Self {
        self.triggering_error = Some(error);
        self
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialMaterial {
    Bearer {
        access_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    /// Cookie values live in the HTTP client's jar; only their names are kept.
    CookieSession {
        domain: String,
        cookie_names: Vec<String>,
    },
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialMaterial::Bearer { refresh_token, .. } => f
                .debug_struct("Bearer")
                .field("access_token", &"<redacted>")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "<redacted>"))
                .finish(),
            CredentialMaterial::CookieSession {
                domain,
                cookie_names,
            } => f
                .debug_struct("CookieSession")
                .field("domain", domain)
                .field("cookie_names", cookie_names)
                .finish(),
        }
    }
}

/// A resolved credential. Immutable once created; the store hands out clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    server_uri: String,
    scheme: Scheme,
    material: CredentialMaterial,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn bearer(
        server_uri: impl Into<String>,
        scheme: Scheme,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<u64>,
    ) -> Self {
        let issued_at = Utc::now();
        let expires_at = expires_in_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| issued_at + Duration::seconds(secs));

        Self {
            server_uri: server_uri.into(),
            scheme,
            material: CredentialMaterial::Bearer {
                access_token: access_token.into(),
                refresh_token,
            },
            issued_at,
            expires_at,
        }
    }

    pub fn cookie_session(server_uri: impl Into<String>, cookies: &CookieSet) -> Self {
        Self {
            server_uri: server_uri.into(),
            scheme: Scheme::CookieSession,
            material: CredentialMaterial::CookieSession {
                domain: cookies.domain().to_string(),
                cookie_names: cookies.names(),
            },
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn material(&self) -> &CredentialMaterial {
        &self.material
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn access_token(&self) -> Option<&str> {
        match &self.material {
            CredentialMaterial::Bearer { access_token, .. } => Some(access_token),
            CredentialMaterial::CookieSession { .. } => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match &self.material {
            CredentialMaterial::Bearer { refresh_token, .. } => refresh_token.as_deref(),
            CredentialMaterial::CookieSession { .. } => None,
        }
    }

    pub fn is_cookie_session(&self) -> bool {
        self.scheme == Scheme::CookieSession
    }

    /// Expired, or expiring within `buffer`. Credentials without an expiry
    /// never expire on their own.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        self.expires_at
            .map(|exp| exp - buffer < Utc::now())
            .unwrap_or(false)
    }

    pub fn time_until_expiration(&self) -> Option<Duration> {
        self.expires_at.map(|exp| exp - Utc::now())
    }
}

/// One cookie captured from a web-view session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Cookies harvested for one domain, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSet {
    domain: String,
    cookies: Vec<Cookie>,
}

impl CookieSet {
    pub fn new(domain: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            domain: domain.into(),
            cookies,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Distinct cookie names in first-seen order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.cookies.len());
        for cookie in &self.cookies {
            if !names.contains(&cookie.name) {
                names.push(cookie.name.clone());
            }
        }
        names
    }
}
