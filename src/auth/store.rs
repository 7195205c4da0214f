/// Process-wide credential cache keyed by (server, scheme)
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::persistence::CredentialPersistence;
use crate::types::{Credential, Scheme};

type StoreKey = (String, Scheme);

/// Reads share the lock; writes are exclusive and replace whole entries, so
/// callers never observe a partially written credential.
pub struct CredentialStore {
    entries: RwLock<HashMap<StoreKey, Credential>>,
    persistence: Option<Arc<dyn CredentialPersistence>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    /// Store that writes bearer credentials through to `persistence` and
    /// falls back to it on a miss.
    pub fn with_persistence(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    pub fn get(&self, server_uri: &str, scheme: Scheme) -> Option<Credential> {
        let key = (server_uri.to_string(), scheme);
        if let Some(credential) = self.entries.read().get(&key) {
            crate::metrics::METRICS.store_hits_total.inc();
            return Some(credential.clone());
        }

        crate::metrics::METRICS.store_misses_total.inc();
        let restored = self.restore(server_uri, scheme)?;

        let mut entries = self.entries.write();
        // A concurrent put wins over the persisted copy
        let credential = entries.entry(key).or_insert(restored).clone();
        self.record_size(entries.len());
        Some(credential)
    }

    pub fn put(&self, server_uri: &str, scheme: Scheme, credential: Credential) {
        {
            let mut entries = self.entries.write();
            entries.insert((server_uri.to_string(), scheme), credential.clone());
            self.record_size(entries.len());
        }
        debug!(server = server_uri, scheme = %scheme, "credential stored");
        self.persist(&credential);
    }

    pub fn invalidate(&self, server_uri: &str, scheme: Scheme) {
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.remove(&(server_uri.to_string(), scheme));
            self.record_size(entries.len());
            removed
        };
        if removed.is_some() {
            debug!(server = server_uri, scheme = %scheme, "credential invalidated");
        }
        self.forget(server_uri, scheme);
    }

    /// Removes the entry only if it still holds `credential`. Used when a
    /// request was rejected with a credential that may have been replaced
    /// by a concurrent negotiation meanwhile.
    pub fn invalidate_if_current(&self, credential: &Credential) -> bool {
        let key = (credential.server_uri().to_string(), credential.scheme());
        let removed = {
            let mut entries = self.entries.write();
            let matches = entries.get(&key) == Some(credential);
            if matches {
                entries.remove(&key);
                self.record_size(entries.len());
            }
            matches
        };
        if removed {
            self.forget(credential.server_uri(), credential.scheme());
        }
        removed
    }

    /// Installs a cookie session and drops every token credential of the
    /// server in the same write, so the two are never active together.
    pub fn replace_session(&self, server_uri: &str, session: Credential) {
        {
            let mut entries = self.entries.write();
            for scheme in Scheme::ALL {
                if scheme != Scheme::CookieSession {
                    entries.remove(&(server_uri.to_string(), scheme));
                }
            }
            entries.insert((server_uri.to_string(), Scheme::CookieSession), session);
            self.record_size(entries.len());
        }
        debug!(server = server_uri, "cookie session replaced token credentials");
        for scheme in Scheme::ALL {
            if scheme != Scheme::CookieSession {
                self.forget(server_uri, scheme);
            }
        }
    }

    /// Every cached credential of a server, in scheme order.
    pub fn credentials_for(&self, server_uri: &str) -> Vec<Credential> {
        let entries = self.entries.read();
        Scheme::ALL
            .iter()
            .filter_map(|scheme| entries.get(&(server_uri.to_string(), *scheme)).cloned())
            .collect()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.record_size(0);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn record_size(&self, size: usize) {
        crate::metrics::METRICS.credentials_cached.set(size as f64);
    }

    fn restore(&self, server_uri: &str, scheme: Scheme) -> Option<Credential> {
        let persistence = self.persistence.as_ref()?;
        match persistence.load(server_uri, scheme) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(server = server_uri, "Failed to restore credential: {}", e);
                None
            }
        }
    }

    // Cookie sessions are never persisted: their values only exist in the jar.
    fn persist(&self, credential: &Credential) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if credential.is_cookie_session() {
            return;
        }
        if let Err(e) = persistence.save(credential) {
            warn!(server = credential.server_uri(), "Failed to persist credential: {}", e);
        }
    }

    fn forget(&self, server_uri: &str, scheme: Scheme) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(e) = persistence.delete(server_uri, scheme) {
            warn!(server = server_uri, "Failed to delete persisted credential: {}", e);
        }
    }
}
