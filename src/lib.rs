pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use auth::{AuthContext, AuthenticatedClient, ChallengeCoordinator, WebViewNavigator};
pub use config::Config;
pub use error::{AuthError, Result};
pub use types::{
    AuthenticationType, Cookie, CookieSet, Credential, CredentialRequest, Scheme, ServerConfig,
    TriggeringError,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
