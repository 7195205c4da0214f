/// OAuth 2.0 authorization-code flow (PKCE) against a portal's sharing endpoints,
/// plus the headless grants that share its token endpoint handling
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl,
    Scope, TokenUrl,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::context::AuthContext;
use super::webview::{WebViewNavigator, redact};
use crate::error::{AuthError, Result};
use crate::types::{Credential, Scheme, ServerConfig};

/// Token-issuing strategies. Each call is a single attempt; retries belong to
/// the coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizationStrategy: Send + Sync {
    /// Interactive authorization-code exchange.
    async fn authorize(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Credential>;

    /// Headless client-credentials grant.
    async fn client_credentials(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Credential>;

    /// Exchanges the refresh token of an expired credential.
    async fn refresh(
        &self,
        server: &ServerConfig,
        stale: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Credential>;
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    // Portals report some failures as 200 with an error object
    error: Option<serde_json::Value>,
    error_description: Option<String>,
}

struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

pub struct AuthorizationCodeFlow {
    ctx: Arc<AuthContext>,
    navigator: Arc<dyn WebViewNavigator>,
}

impl AuthorizationCodeFlow {
    pub fn new(ctx: Arc<AuthContext>, navigator: Arc<dyn WebViewNavigator>) -> Self {
        Self { ctx, navigator }
    }

    /// Authorization URL and the CSRF state embedded in it.
    pub fn build_authorize_url(
        server: &ServerConfig,
        challenge: PkceCodeChallenge,
    ) -> Result<(Url, CsrfToken)> {
        let client = oauth_client(server)?;
        let scopes = server.scopes.iter().cloned().map(Scope::new);
        Ok(client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(challenge)
            .add_scopes(scopes)
            .url())
    }

    async fn run_authorization_code(
        &self,
        server: &ServerConfig,
        authorize_url: &Url,
        state: &CsrfToken,
        verifier: PkceCodeVerifier,
    ) -> Result<Credential> {
        let redirect = redirect_url(server)?;

        // The proxy shows itself on the very first response
        self.probe(authorize_url).await?;

        self.navigator.navigate(authorize_url).await?;
        let callback = loop {
            match self.navigator.next_navigation().await {
                None => return Err(AuthError::Canceled),
                Some(landed) if is_redirect_callback(&landed, &redirect) => break landed,
                Some(landed) => debug!(uri = %redact(&landed), "authorization page navigated"),
            }
        };
        let code = parse_callback(&callback, state.secret())?;
        debug!("authorization code captured");

        let grant = self
            .request_token(
                server,
                "authorization_code",
                vec![
                    ("code", code),
                    ("redirect_uri", redirect.to_string()),
                    ("code_verifier", verifier.secret().to_string()),
                ],
            )
            .await?;

        Ok(Credential::bearer(
            server.base_uri.clone(),
            Scheme::OAuthAuthorizationCode,
            grant.access_token,
            grant.refresh_token,
            grant.expires_in,
        ))
    }

    async fn probe(&self, authorize_url: &Url) -> Result<()> {
        let res = self
            .ctx
            .oauth_http()
            .get(authorize_url.clone())
            .send()
            .await
            .map_err(|e| {
                AuthError::auth_failed(format!("authorization endpoint unreachable: {}", e))
            })?;
        self.ctx.interceptor().inspect_response(&res).into_result()
    }

    async fn request_token(
        &self,
        server: &ServerConfig,
        grant_type: &'static str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<TokenGrant> {
        let client_id = server.oauth_client_id.clone().ok_or_else(|| {
            AuthError::InvalidConfig(format!("no OAuth client id for {}", server.base_uri))
        })?;
        params.insert(0, ("grant_type", grant_type.to_string()));
        params.push(("client_id", client_id));
        if let Some(secret) = &server.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let res = self
            .ctx
            .oauth_http()
            .post(server.token_uri())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::auth_failed(format!("token endpoint unreachable: {}", e)))?;

        self.ctx.interceptor().inspect_response(&res).into_result()?;

        let status = res.status();
        crate::metrics::METRICS
            .token_requests_total
            .with_label_values(&[grant_type, status.as_str()])
            .inc();

        if !status.is_success() {
            let error_text = res.text().await.unwrap_or_default();
            return Err(AuthError::auth_failed(format!(
                "token endpoint returned {}: {}",
                status,
                truncate(&error_text, 200)
            )));
        }

        let reply: TokenReply = res
            .json()
            .await
            .map_err(|e| AuthError::auth_failed(format!("unreadable token response: {}", e)))?;

        if let Some(error) = &reply.error {
            return Err(AuthError::auth_failed(format!(
                "token endpoint refused {} grant: {}",
                grant_type,
                describe_error(error, reply.error_description.as_deref())
            )));
        }

        let access_token = reply
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::auth_failed("token response has no access_token"))?;

        Ok(TokenGrant {
            access_token,
            refresh_token: reply.refresh_token,
            expires_in: reply.expires_in,
        })
    }
}

#[async_trait]
impl AuthorizationStrategy for AuthorizationCodeFlow {
    async fn authorize(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let (authorize_url, state) = Self::build_authorize_url(server, challenge)?;
        info!(server = %server.base_uri, "starting OAuth authorization");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            result = self.run_authorization_code(server, &authorize_url, &state, verifier) => result,
        };

        self.navigator.close().await;
        result
    }

    async fn client_credentials(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        info!(server = %server.base_uri, "requesting client-credentials token");
        let mut params = Vec::new();
        if !server.scopes.is_empty() {
            params.push(("scope", server.scopes.join(" ")));
        }

        let grant = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            grant = self.request_token(server, "client_credentials", params) => grant,
        }?;

        Ok(Credential::bearer(
            server.base_uri.clone(),
            Scheme::OAuthClientCredentials,
            grant.access_token,
            grant.refresh_token,
            grant.expires_in,
        ))
    }

    async fn refresh(
        &self,
        server: &ServerConfig,
        stale: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        let refresh_token = stale
            .refresh_token()
            .ok_or_else(|| AuthError::auth_failed("No refresh token available"))?
            .to_string();
        debug!(server = %server.base_uri, "refreshing access token");

        let grant = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            grant = self.request_token(
                server,
                "refresh_token",
                vec![("refresh_token", refresh_token.clone())],
            ) => grant,
        }?;

        // Servers that do not rotate refresh tokens omit them from the reply
        Ok(Credential::bearer(
            server.base_uri.clone(),
            stale.scheme(),
            grant.access_token,
            grant.refresh_token.or(Some(refresh_token)),
            grant.expires_in,
        ))
    }
}

fn oauth_client(server: &ServerConfig) -> Result<BasicClient> {
    let client_id = server.oauth_client_id.clone().ok_or_else(|| {
        AuthError::InvalidConfig(format!("no OAuth client id for {}", server.base_uri))
    })?;
    let auth_url = AuthUrl::new(server.authorize_uri())
        .map_err(|e| AuthError::InvalidConfig(format!("invalid authorize URI: {}", e)))?;
    let token_url = TokenUrl::new(server.token_uri())
        .map_err(|e| AuthError::InvalidConfig(format!("invalid token URI: {}", e)))?;

    let client = BasicClient::new(
        ClientId::new(client_id),
        server.client_secret.clone().map(ClientSecret::new),
        auth_url,
        Some(token_url),
    );

    match &server.oauth_redirect_uri {
        Some(redirect) => {
            let redirect = RedirectUrl::new(redirect.clone())
                .map_err(|e| AuthError::InvalidConfig(format!("invalid redirect URI: {}", e)))?;
            Ok(client.set_redirect_uri(redirect))
        }
        None => Ok(client),
    }
}

fn redirect_url(server: &ServerConfig) -> Result<Url> {
    let raw = server.oauth_redirect_uri.as_deref().ok_or_else(|| {
        AuthError::InvalidConfig(format!("no redirect URI for {}", server.base_uri))
    })?;
    Url::parse(raw).map_err(|e| AuthError::InvalidConfig(format!("invalid redirect URI: {}", e)))
}

/// True when `landed` is the redirect URI itself, optionally followed by a
/// path, query or fragment.
pub(crate) fn is_redirect_callback(landed: &Url, redirect: &Url) -> bool {
    let prefix = redirect.as_str().trim_end_matches('/');
    match landed.as_str().strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(['?', '/', '#']),
        None => false,
    }
}

/// Authorization code from the redirect, after checking `state`.
pub(crate) fn parse_callback(callback: &Url, expected_state: &str) -> Result<String> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;

    for (key, value) in callback.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        if error == "access_denied" {
            return Err(AuthError::Canceled);
        }
        return Err(AuthError::auth_failed(match description {
            Some(description) => format!("authorization failed: {} ({})", error, description),
            None => format!("authorization failed: {}", error),
        }));
    }

    match state.as_deref() {
        Some(state) if state == expected_state => {}
        Some(_) => return Err(AuthError::auth_failed("State mismatch - possible CSRF attack!")),
        None => return Err(AuthError::auth_failed("authorization callback missing state")),
    }

    code.filter(|code| !code.is_empty())
        .ok_or_else(|| AuthError::auth_failed("no authorization code received"))
}

fn describe_error(error: &serde_json::Value, description: Option<&str>) -> String {
    let detail = match error {
        serde_json::Value::String(code) => code.clone(),
        serde_json::Value::Object(fields) => ["error_description", "message", "error"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    };
    match description {
        Some(description) => format!("{} ({})", detail, description),
        None => detail,
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::ScriptedNavigator;
    use crate::types::AuthenticationType;
    use mockito::Matcher;
    use std::time::Duration;

    const TOKEN_BODY: &str =
        r#"{"access_token":"access-1","refresh_token":"refresh-1","expires_in":1800,"username":"gisuser"}"#;

    fn portal(base: &str) -> ServerConfig {
        ServerConfig::new(base, AuthenticationType::OAuthAuthorizationCode)
            .with_oauth_client("ABC123", "app://auth")
    }

    fn flow(navigator: Arc<ScriptedNavigator>) -> AuthorizationCodeFlow {
        AuthorizationCodeFlow::new(Arc::new(AuthContext::new().unwrap()), navigator)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_authorize_url_parameters() {
        let (challenge, _) = PkceCodeChallenge::new_random_sha256();
        let (url, state) = AuthorizationCodeFlow::build_authorize_url(
            &portal("https://portal.example.com").with_scope("openid"),
            challenge,
        )
        .unwrap();

        assert!(url.as_str().starts_with("https://portal.example.com/sharing/oauth2/authorize?"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |key: &str| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("client_id"), Some("ABC123"));
        assert_eq!(get("redirect_uri"), Some("app://auth"));
        assert_eq!(get("code_challenge_method"), Some("S256"));
        assert_eq!(get("scope"), Some("openid"));
        assert_eq!(get("state"), Some(state.secret().as_str()));
    }

    #[test]
    fn test_redirect_callback_matching() {
        let redirect = url("app://auth");
        assert!(is_redirect_callback(&url("app://auth?code=1&state=2"), &redirect));
        assert!(is_redirect_callback(&url("app://auth"), &redirect));
        assert!(!is_redirect_callback(&url("app://authx?code=1"), &redirect));
        assert!(!is_redirect_callback(
            &url("https://portal.example.com/sharing/oauth2/signin"),
            &redirect
        ));
    }

    #[test]
    fn test_parse_callback() {
        let code = parse_callback(&url("app://auth?code=abc&state=s1"), "s1").unwrap();
        assert_eq!(code, "abc");

        assert!(matches!(
            parse_callback(&url("app://auth?code=abc&state=other"), "s1"),
            Err(AuthError::AuthFailed(_))
        ));
        assert!(matches!(
            parse_callback(&url("app://auth?code=abc"), "s1"),
            Err(AuthError::AuthFailed(_))
        ));
        assert!(matches!(
            parse_callback(&url("app://auth?state=s1"), "s1"),
            Err(AuthError::AuthFailed(_))
        ));
        assert_eq!(
            parse_callback(&url("app://auth?error=access_denied&state=s1"), "s1"),
            Err(AuthError::Canceled)
        );
        assert!(matches!(
            parse_callback(&url("app://auth?error=server_error"), "s1"),
            Err(AuthError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_describe_portal_error_object() {
        let error = serde_json::json!({"code": 400, "error": "invalid_request", "error_description": "Invalid redirect_uri"});
        assert_eq!(describe_error(&error, None), "Invalid redirect_uri");
        assert_eq!(
            describe_error(&serde_json::json!("invalid_grant"), Some("expired")),
            "invalid_grant (expired)"
        );
    }

    #[tokio::test]
    async fn test_authorization_code_exchange() {
        let mut server = mockito::Server::new_async().await;
        let authorize = server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>sign in</html>")
            .create_async()
            .await;
        let token = server
            .mock("POST", "/sharing/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("client_id".into(), "ABC123".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "app://auth".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(TOKEN_BODY)
            .expect(1)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::authorizing("app://auth", "the-code"));
        let credential = flow(navigator.clone())
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credential.scheme(), Scheme::OAuthAuthorizationCode);
        assert_eq!(credential.access_token(), Some("access-1"));
        assert_eq!(credential.refresh_token(), Some("refresh-1"));
        assert!(credential.expires_at().is_some());
        assert_eq!(navigator.navigated().len(), 1);
        assert_eq!(navigator.closed(), 1);

        authorize.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_intercepted_authorize_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(302)
            .with_header("server", "BigIP")
            .with_header("location", "/my.policy")
            .create_async()
            .await;
        let token = server
            .mock("POST", "/sharing/oauth2/token")
            .expect(0)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::authorizing("app://auth", "the-code"));
        let err = flow(navigator.clone())
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Intercepted(_)));
        assert!(navigator.navigated().is_empty());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_intercepted_token_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/sharing/oauth2/token")
            .with_status(200)
            .with_header("server", "BigIP")
            .with_body("<html>session expired</html>")
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::authorizing("app://auth", "the-code"));
        let err = flow(navigator)
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Intercepted(_)));
    }

    #[tokio::test]
    async fn test_token_endpoint_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/sharing/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::authorizing("app://auth", "the-code"));
        let err = flow(navigator)
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_error_object_in_success_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", "/sharing/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"code":498,"error":"invalid_token","message":"Invalid token."}}"#)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::authorizing("app://auth", "the-code"));
        let err = flow(navigator)
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::AuthFailed(
                "token endpoint refused authorization_code grant: Invalid token.".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_denied_consent_is_canceled() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::new(
            vec![Some(url("app://auth?error=access_denied"))],
            vec![],
        ));
        let err = flow(navigator.clone())
            .authorize(&portal(&server.url()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::Canceled);
        assert_eq!(navigator.closed(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_redirect() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/oauth2/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let navigator = Arc::new(ScriptedNavigator::new(vec![], vec![]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = flow(navigator.clone())
            .authorize(&portal(&server.url()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Canceled);
        assert_eq!(navigator.closed(), 1);
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sharing/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"access-2","expires_in":1800}"#)
            .create_async()
            .await;

        let config = portal(&server.url());
        let stale = Credential::bearer(
            config.base_uri.clone(),
            Scheme::OAuthAuthorizationCode,
            "access-1",
            Some("refresh-1".to_string()),
            Some(0),
        );

        let navigator = Arc::new(ScriptedNavigator::new(vec![], vec![]));
        let refreshed = flow(navigator)
            .refresh(&config, &stale, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(refreshed.access_token(), Some("access-2"));
        assert_eq!(refreshed.refresh_token(), Some("refresh-1"));
        assert_eq!(refreshed.scheme(), Scheme::OAuthAuthorizationCode);
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sharing/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "ABC123".into()),
                Matcher::UrlEncoded("client_secret".into(), "s3cret".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"app-token","expires_in":7200}"#)
            .create_async()
            .await;

        let config = ServerConfig::new(server.url(), AuthenticationType::OAuthClientCredentials)
            .with_oauth_client("ABC123", "app://auth")
            .with_client_secret("s3cret");

        let navigator = Arc::new(ScriptedNavigator::new(vec![], vec![]));
        let credential = flow(navigator.clone())
            .client_credentials(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credential.scheme(), Scheme::OAuthClientCredentials);
        assert_eq!(credential.access_token(), Some("app-token"));
        assert!(navigator.navigated().is_empty());
    }
}
