/// HTTP client that negotiates credentials for registered servers and retries
/// once when a request is challenged
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{IntoUrl, Request, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::coordinator::ChallengeCoordinator;
use crate::error::{AuthError, Result};
use crate::types::{Credential, CredentialRequest, TriggeringError};

#[derive(Clone)]
pub struct AuthenticatedClient {
    coordinator: Arc<ChallengeCoordinator>,
}

impl AuthenticatedClient {
    pub fn new(coordinator: Arc<ChallengeCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<ChallengeCoordinator> {
        &self.coordinator
    }

    /// The underlying client. It shares the cookie jar that web-view sessions
    /// are propagated into.
    pub fn http(&self) -> &reqwest::Client {
        self.coordinator.context().http()
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http().get(url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http().post(url)
    }

    pub async fn send(&self, request: Request) -> Result<Response> {
        self.send_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Sends `request` with the credential of the server it targets.
    ///
    /// A 401, a 403 or a response from an intermediary invalidates the
    /// credential that was used and re-negotiates with that error as the
    /// trigger; the request is then retried once. Requests whose body cannot
    /// be replayed are not retried.
    pub async fn send_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let ctx = self.coordinator.context();
        let target = request.url().to_string();

        if ctx.registry().lookup(&target).is_none() {
            debug!("no server registered for request, sending as is");
            return self.execute(request, cancel).await;
        }

        let retry = request.try_clone();
        let credential = self
            .coordinator
            .resolve_with_cancel(CredentialRequest::new(target.clone()), cancel)
            .await?;
        let response = self.dispatch(request, &credential, cancel).await?;

        let Some(trigger) = self.challenge(&response) else {
            return Ok(response);
        };
        let Some(retry) = retry else {
            debug!("challenged request has a streaming body, not retrying");
            return Ok(response);
        };

        info!(
            status = %response.status(),
            trigger = trigger_label(trigger),
            "request challenged, renegotiating"
        );
        crate::metrics::METRICS
            .request_retries_total
            .with_label_values(&[trigger_label(trigger)])
            .inc();

        ctx.store().invalidate_if_current(&credential);
        let credential = self
            .coordinator
            .resolve_with_cancel(
                CredentialRequest::new(target).with_triggering_error(trigger),
                cancel,
            )
            .await?;
        self.dispatch(retry, &credential, cancel).await
    }

    fn challenge(&self, response: &Response) -> Option<TriggeringError> {
        let interceptor = self.coordinator.context().interceptor();
        if interceptor.inspect_response(response).intercepted {
            return Some(TriggeringError::Intercepted);
        }
        match response.status() {
            StatusCode::UNAUTHORIZED => Some(TriggeringError::Unauthorized),
            StatusCode::FORBIDDEN => Some(TriggeringError::Forbidden),
            _ => None,
        }
    }

    // Cookie sessions need nothing here: the jar already carries them
    async fn dispatch(
        &self,
        mut request: Request,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if let Some(token) = credential.access_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| AuthError::auth_failed("access token is not a valid header value"))?;
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        self.execute(request, cancel).await
    }

    async fn execute(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Canceled),
            result = self.http().execute(request) => {
                result.map_err(|e| AuthError::Transport(e.to_string()))
            }
        }
    }
}

fn trigger_label(trigger: TriggeringError) -> &'static str {
    match trigger {
        TriggeringError::Unauthorized => "unauthorized",
        TriggeringError::Forbidden => "forbidden",
        TriggeringError::Intercepted => "intercepted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::context::AuthContext;
    use crate::auth::oauth::MockAuthorizationStrategy;
    use crate::auth::webview::MockFallbackStrategy;
    use crate::types::{AuthenticationType, Cookie, CookieSet, Scheme, ServerConfig};
    use mockito::Matcher;

    fn client(
        registered: Option<&str>,
        oauth: MockAuthorizationStrategy,
        fallback: MockFallbackStrategy,
    ) -> AuthenticatedClient {
        let ctx = AuthContext::new().unwrap();
        if let Some(base) = registered {
            ctx.registry()
                .register(
                    ServerConfig::new(base, AuthenticationType::OAuthAuthorizationCode)
                        .with_oauth_client("ABC123", "app://auth"),
                )
                .unwrap();
        }
        let coordinator = ChallengeCoordinator::with_strategies(
            Arc::new(ctx),
            Arc::new(oauth),
            Arc::new(fallback),
        );
        AuthenticatedClient::new(Arc::new(coordinator))
    }

    fn issuing(tokens: &'static [&'static str]) -> MockAuthorizationStrategy {
        let mut oauth = MockAuthorizationStrategy::new();
        let mut issued = 0;
        oauth
            .expect_authorize()
            .times(tokens.len())
            .returning(move |server, _| {
                let token = tokens[issued];
                issued += 1;
                Ok(Credential::bearer(
                    server.base_uri.clone(),
                    Scheme::OAuthAuthorizationCode,
                    token,
                    None,
                    Some(3600),
                ))
            });
        oauth
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sharing/rest/portals/self")
            .match_header("authorization", "Bearer t1")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client(Some(&server.url()), issuing(&["t1"]), MockFallbackStrategy::new());
        let request = client
            .get(format!("{}/sharing/rest/portals/self", server.url()))
            .build()
            .unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_response_retried_with_new_credential() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/sharing/rest/content")
            .match_header("authorization", "Bearer t1")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/sharing/rest/content")
            .match_header("authorization", "Bearer t2")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = client(
            Some(&server.url()),
            issuing(&["t1", "t2"]),
            MockFallbackStrategy::new(),
        );
        let request = client
            .get(format!("{}/sharing/rest/content", server.url()))
            .build()
            .unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_rejection_is_returned() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/rest/content")
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let client = client(
            Some(&server.url()),
            issuing(&["t1", "t2"]),
            MockFallbackStrategy::new(),
        );
        let request = client
            .get(format!("{}/sharing/rest/content", server.url()))
            .build()
            .unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unregistered_server_passthrough() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/public")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let client = client(
            None,
            MockAuthorizationStrategy::new(),
            MockFallbackStrategy::new(),
        );
        let request = client.get(format!("{}/public", server.url())).build().unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_intercepted_response_switches_to_cookie_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sharing/rest/content")
            .match_header("authorization", "Bearer t1")
            .with_status(200)
            .with_header("server", "BigIP")
            .with_body("<html>access policy</html>")
            .expect(1)
            .create_async()
            .await;
        let with_session = server
            .mock("GET", "/sharing/rest/content")
            .match_header("cookie", Matcher::Regex("JSESSIONID=xyz".to_string()))
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let mut fallback = MockFallbackStrategy::new();
        fallback.expect_login_via_webview().times(1).returning(|_, _| {
            Ok(CookieSet::new(
                "127.0.0.1",
                vec![Cookie::new("JSESSIONID", "xyz", "127.0.0.1")],
            ))
        });

        let client = client(Some(&server.url()), issuing(&["t1"]), fallback);
        let request = client
            .get(format!("{}/sharing/rest/content", server.url()))
            .build()
            .unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        with_session.assert_async().await;
    }
}
