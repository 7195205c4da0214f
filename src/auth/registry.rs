/// Server registry: base URI -> authentication configuration
use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::error::{AuthError, Result};
use crate::types::{AuthenticationType, ServerConfig};

struct RegisteredServer {
    base: Url,
    config: ServerConfig,
}

#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<Vec<RegisteredServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a server. Re-registering the same base URI
    /// replaces the earlier configuration.
    pub fn register(&self, mut config: ServerConfig) -> Result<()> {
        let base = parse_base_uri(&config.base_uri)?;
        validate(&config)?;
        config.base_uri = server_key(&base);

        let mut servers = self.servers.write();
        if let Some(existing) = servers.iter_mut().find(|s| s.base == base) {
            debug!(server = %config.base_uri, "replacing server registration");
            existing.config = config;
        } else {
            info!(
                server = %config.base_uri,
                auth = %config.authentication_type,
                "registered server"
            );
            servers.push(RegisteredServer { base, config });
        }
        Ok(())
    }

    /// Configuration of the registered server with the longest base URI that
    /// prefixes `uri` on the same origin.
    pub fn lookup(&self, uri: &str) -> Option<ServerConfig> {
        let target = Url::parse(uri).ok()?;
        let servers = self.servers.read();
        servers
            .iter()
            .filter(|server| covers(&server.base, &target))
            .max_by_key(|server| server.base.path().len())
            .map(|server| server.config.clone())
    }

    pub fn unregister(&self, base_uri: &str) -> bool {
        let Ok(base) = parse_base_uri(base_uri) else {
            return false;
        };
        let mut servers = self.servers.write();
        let before = servers.len();
        servers.retain(|server| server.base != base);
        servers.len() != before
    }

    pub fn servers(&self) -> Vec<ServerConfig> {
        self.servers
            .read()
            .iter()
            .map(|server| server.config.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}

/// Normalized base: no query or fragment, no trailing slash on the path.
fn parse_base_uri(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| AuthError::InvalidConfig(format!("base URI '{}' is not a URL: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AuthError::InvalidConfig(format!(
            "base URI '{}' must use http or https",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(AuthError::InvalidConfig(format!(
            "base URI '{}' has no host",
            raw
        )));
    }

    url.set_query(None);
    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    Ok(url)
}

fn server_key(base: &Url) -> String {
    base.as_str().trim_end_matches('/').to_string()
}

fn validate(config: &ServerConfig) -> Result<()> {
    if config.authentication_type.is_oauth() {
        let client_id = config.oauth_client_id.as_deref().unwrap_or_default();
        if client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig(format!(
                "{} requires an OAuth client id for {}",
                config.authentication_type, config.base_uri
            )));
        }
    }

    if config.authentication_type == AuthenticationType::OAuthAuthorizationCode {
        let redirect = config.oauth_redirect_uri.as_deref().ok_or_else(|| {
            AuthError::InvalidConfig(format!(
                "OAuthAuthorizationCode requires a redirect URI for {}",
                config.base_uri
            ))
        })?;
        check_url("redirect URI", redirect)?;
    }

    if config.authentication_type == AuthenticationType::OAuthClientCredentials
        && config.client_secret.as_deref().unwrap_or_default().is_empty()
    {
        return Err(AuthError::InvalidConfig(format!(
            "OAuthClientCredentials requires a client secret for {}",
            config.base_uri
        )));
    }

    for (label, uri) in [
        ("home URI", config.home_uri.as_deref()),
        ("authorize URI", config.authorize_uri.as_deref()),
        ("token URI", config.token_uri.as_deref()),
    ] {
        if let Some(uri) = uri {
            check_url(label, uri)?;
        }
    }

    Ok(())
}

fn check_url(label: &str, raw: &str) -> Result<()> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|e| AuthError::InvalidConfig(format!("{} '{}' is not a URL: {}", label, raw, e)))
}

/// Same origin, and the base path is a whole-segment prefix of the target path.
fn covers(base: &Url, target: &Url) -> bool {
    if base.scheme() != target.scheme()
        || base.host_str() != target.host_str()
        || base.port_or_known_default() != target.port_or_known_default()
    {
        return false;
    }

    let base_path = base.path().trim_end_matches('/');
    let target_path = target.path();
    match target_path.strip_prefix(base_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal(base: &str) -> ServerConfig {
        ServerConfig::new(base, AuthenticationType::OAuthAuthorizationCode)
            .with_oauth_client("ABC123", "app://auth")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://portal.example.com/")).unwrap();

        let found = registry
            .lookup("https://portal.example.com/sharing/rest/portals/self?f=json")
            .unwrap();
        assert_eq!(found.base_uri, "https://portal.example.com");
        assert_eq!(found.oauth_client_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_lookup_prefers_longest_prefix() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://gis.example.com")).unwrap();
        registry
            .register(portal("https://gis.example.com/portal").with_scope("openid"))
            .unwrap();

        let found = registry.lookup("https://gis.example.com/portal/home").unwrap();
        assert_eq!(found.base_uri, "https://gis.example.com/portal");

        let found = registry.lookup("https://gis.example.com/server/rest").unwrap();
        assert_eq!(found.base_uri, "https://gis.example.com");
    }

    #[test]
    fn test_lookup_respects_segment_boundaries_and_origin() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://gis.example.com/portal")).unwrap();

        assert!(registry.lookup("https://gis.example.com/portal2/home").is_none());
        assert!(registry.lookup("http://gis.example.com/portal/home").is_none());
        assert!(registry.lookup("https://gis.example.com:8443/portal").is_none());
        assert!(registry.lookup("https://gis.example.com:443/portal").is_some());
        assert!(registry.lookup("not a url").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://portal.example.com")).unwrap();
        registry
            .register(
                ServerConfig::new("https://portal.example.com/", AuthenticationType::Token)
                    .with_home_uri("https://portal.example.com/portal/home"),
            )
            .unwrap();

        assert_eq!(registry.len(), 1);
        let found = registry.lookup("https://portal.example.com").unwrap();
        assert_eq!(found.authentication_type, AuthenticationType::Token);
    }

    #[test]
    fn test_invalid_base_uri() {
        let registry = ServerRegistry::new();
        for bad in ["portal.example.com", "ftp://portal.example.com", "::"] {
            let err = registry.register(portal(bad)).unwrap_err();
            assert!(matches!(err, AuthError::InvalidConfig(_)), "{}", bad);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_oauth_requires_client_settings() {
        let registry = ServerRegistry::new();

        let missing_client = ServerConfig::new(
            "https://portal.example.com",
            AuthenticationType::OAuthAuthorizationCode,
        );
        assert!(matches!(
            registry.register(missing_client),
            Err(AuthError::InvalidConfig(_))
        ));

        let bad_redirect = ServerConfig::new(
            "https://portal.example.com",
            AuthenticationType::OAuthAuthorizationCode,
        )
        .with_oauth_client("ABC123", "not a redirect");
        assert!(matches!(
            registry.register(bad_redirect),
            Err(AuthError::InvalidConfig(_))
        ));

        let no_secret = ServerConfig::new(
            "https://portal.example.com",
            AuthenticationType::OAuthClientCredentials,
        )
        .with_oauth_client("ABC123", "app://auth");
        assert!(matches!(
            registry.register(no_secret),
            Err(AuthError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_failed_registration_keeps_other_servers() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://portal.example.com")).unwrap();
        assert!(registry.register(portal("nope")).is_err());

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("https://portal.example.com/home").is_some());
    }

    #[test]
    fn test_unregister() {
        let registry = ServerRegistry::new();
        registry.register(portal("https://portal.example.com")).unwrap();

        assert!(registry.unregister("https://portal.example.com/"));
        assert!(!registry.unregister("https://portal.example.com"));
        assert!(registry.lookup("https://portal.example.com").is_none());
    }
}
