// Credential negotiation: store, registry, strategies and the coordinator

pub mod client;
pub mod console;
pub mod context;
pub mod cookies;
pub mod coordinator;
pub mod interceptor;
pub mod oauth;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod webview;

#[cfg(test)]
mod testing;

pub use client::AuthenticatedClient;
pub use console::ConsoleNavigator;
pub use context::{AuthContext, AuthContextBuilder};
pub use cookies::CookieBridge;
pub use coordinator::{ChallengeCoordinator, NegotiationState};
pub use interceptor::{InterceptRule, InterceptSignal, ResponseInterceptor};
pub use oauth::{AuthorizationCodeFlow, AuthorizationStrategy};
pub use persistence::{CredentialPersistence, KeyringPersistence};
pub use registry::ServerRegistry;
pub use store::CredentialStore;
pub use webview::{FallbackStrategy, WebViewLogin, WebViewNavigator};
