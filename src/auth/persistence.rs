/// Optional on-disk persistence for resolved credentials.
/// The keyring backend uses the native store: Secret Service (Linux), Keychain (macOS),
/// Credential Manager (Windows)
use keyring::Entry;

use crate::error::{AuthError, Result};
use crate::types::{Credential, Scheme};

/// Backing storage the credential store writes through to.
pub trait CredentialPersistence: Send + Sync {
    fn load(&self, server_uri: &str, scheme: Scheme) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn delete(&self, server_uri: &str, scheme: Scheme) -> Result<()>;
}

pub struct KeyringPersistence {
    service: String,
}

impl KeyringPersistence {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, server_uri: &str, scheme: Scheme) -> Result<Entry> {
        Entry::new(&self.service, &entry_name(server_uri, scheme))
            .map_err(|e| AuthError::auth_failed(format!("keyring unavailable: {}", e)))
    }
}

fn entry_name(server_uri: &str, scheme: Scheme) -> String {
    format!("{}#{}", server_uri, scheme.as_str())
}

impl CredentialPersistence for KeyringPersistence {
    fn load(&self, server_uri: &str, scheme: Scheme) -> Result<Option<Credential>> {
        let entry = self.entry(server_uri, scheme)?;
        match entry.get_password() {
            Ok(json) => {
                let credential: Credential = serde_json::from_str(&json).map_err(|e| {
                    AuthError::auth_failed(format!("corrupt keyring entry: {}", e))
                })?;
                Ok(Some(credential))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::auth_failed(format!("keyring read failed: {}", e))),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let entry = self.entry(credential.server_uri(), credential.scheme())?;
        let json = serde_json::to_string(credential)
            .map_err(|e| AuthError::auth_failed(format!("cannot encode credential: {}", e)))?;
        entry
            .set_password(&json)
            .map_err(|e| AuthError::auth_failed(format!("keyring write failed: {}", e)))
    }

    fn delete(&self, server_uri: &str, scheme: Scheme) -> Result<()> {
        let entry = self.entry(server_uri, scheme)?;
        match entry.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(AuthError::auth_failed(format!("keyring delete failed: {}", e))),
        }
    }
}
