use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, sync::Arc};

use crate::auth::{AuthContext, InterceptRule, KeyringPersistence, ResponseInterceptor};
use crate::types::{AuthenticationType, ServerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub interceptor: InterceptorConfig,
    #[serde(default)]
    pub webview: WebViewConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// One `[[servers]]` entry. The authentication type stays a string here so a
/// typo is reported against the entry that carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub base_uri: String,
    #[serde(default = "default_authentication_type")]
    pub authentication_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_redirect_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    #[serde(default = "default_intercept_rules")]
    pub rules: Vec<InterceptRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebViewConfig {
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_expiry_buffer")]
    pub expiry_buffer_secs: u64,
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,
}

// Defaults
fn default_log_level() -> String { "info".to_string() }
fn default_authentication_type() -> String { "OAuthAuthorizationCode".to_string() }
fn default_intercept_rules() -> Vec<InterceptRule> { vec![InterceptRule::default()] }
fn default_max_redirects() -> usize { 10 }
fn default_expiry_buffer() -> u64 { 300 }
fn default_keyring_service() -> String { "portal-auth".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            rules: default_intercept_rules(),
        }
    }
}

impl Default for WebViewConfig {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            expiry_buffer_secs: default_expiry_buffer(),
            persist: false,
            keyring_service: default_keyring_service(),
        }
    }
}

impl ServerEntry {
    /// Typed server configuration. Empty optional fields (e.g. an unset
    /// `${VAR}`) count as absent.
    pub fn to_server_config(&self) -> crate::error::Result<ServerConfig> {
        let authentication_type: AuthenticationType = self.authentication_type.parse()?;

        Ok(ServerConfig {
            base_uri: self.base_uri.clone(),
            authentication_type,
            oauth_client_id: non_empty(&self.oauth_client_id),
            oauth_redirect_uri: non_empty(&self.oauth_redirect_uri),
            client_secret: non_empty(&self.client_secret),
            home_uri: non_empty(&self.home_uri),
            authorize_uri: non_empty(&self.authorize_uri),
            token_uri: non_empty(&self.token_uri),
            scopes: self.scopes.clone(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Try to find config file
        let config_path = env::var("PORTAL_AUTH_CONFIG").unwrap_or_else(|_| {
            // Check common locations
            let home_config = format!(
                "{}/.config/portal-auth/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec![
                "./portal-auth.toml",
                "./config.toml",
                "/etc/portal-auth/config.toml",
                home_config.as_str(),
            ];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            // Default
            "./portal-auth.toml".to_string()
        });

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> Result<Self> {
        // Validate config file permissions on Unix systems
        #[cfg(unix)]
        Self::validate_file_permissions(config_path)?;

        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        Self::from_toml_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = Self::substitute_env_vars(content);
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Fresh authentication context with every configured server registered.
    pub fn build_context(&self) -> Result<Arc<AuthContext>> {
        let mut builder = AuthContext::builder()
            .interceptor(ResponseInterceptor::new(self.interceptor.rules.clone()))
            .expiry_buffer_secs(self.credentials.expiry_buffer_secs)
            .max_webview_redirects(self.webview.max_redirects);

        if self.credentials.persist {
            tracing::debug!(
                service = %self.credentials.keyring_service,
                "Persisting credentials in system keyring"
            );
            builder = builder.persistence(Arc::new(KeyringPersistence::new(
                &self.credentials.keyring_service,
            )));
        }

        let ctx = builder.build()?;
        for (idx, entry) in self.servers.iter().enumerate() {
            entry
                .to_server_config()
                .and_then(|server| ctx.registry().register(server))
                .with_context(|| format!("servers[{}] ({})", idx, entry.base_uri))?;
        }

        if self.servers.is_empty() {
            tracing::warn!("No servers configured - every request will be sent unauthenticated");
        }

        Ok(Arc::new(ctx))
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = String::with_capacity(content.len());
        let mut rest = content;

        // Substituted values are copied verbatim, never scanned again
        while let Some(start) = rest.find("${") {
            let Some(end) = rest[start..].find('}') else {
                break;
            };
            result.push_str(&rest[..start]);
            let var_name = &rest[start + 2..start + end];
            result.push_str(&env::var(var_name).unwrap_or_default());
            rest = &rest[start + end + 1..];
        }
        result.push_str(rest);

        result
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        // Reading reports the missing file
        if !path_obj.exists() {
            tracing::debug!("Config file does not exist: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;

        let permissions = metadata.permissions();
        let mode = permissions.mode();

        // Check if file is readable by group or others (we want 0600 or 0400)
        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "⚠️  Config file {} has insecure permissions: {:o}",
                path,
                mode & 0o777
            );
            tracing::warn!(
                "   Recommended: chmod 600 {} (to make it readable/writable only by owner)",
                path
            );
            tracing::warn!(
                "   This file may contain OAuth client secrets and should not be readable by other users."
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}
