//! Shared provider registry.
//!
//! Owns the authoritative provider list. Reads take a cheap `Arc` snapshot;
//! mutations replace the snapshot atomically and bump a watch channel so
//! interested tasks can observe changes without polling.

use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::config::{ProviderConfig, ProviderKey};

pub struct ProviderRegistry {
    providers: RwLock<Arc<Vec<Arc<ProviderConfig>>>>,
    changes: watch::Sender<u64>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        let providers = Arc::new(providers.into_iter().map(Arc::new).collect::<Vec<_>>());
        let (changes, _) = watch::channel(0);
        Self {
            providers: RwLock::new(providers),
            changes,
        }
    }

    /// Current provider list. The snapshot is immutable; a request works
    /// against one snapshot for its whole lifetime.
    pub fn snapshot(&self) -> Arc<Vec<Arc<ProviderConfig>>> {
        Arc::clone(&self.providers.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Look up a provider by identity in the current snapshot.
    pub fn get(&self, key: &ProviderKey) -> Option<Arc<ProviderConfig>> {
        self.snapshot().iter().find(|p| p.key() == *key).cloned()
    }

    /// Look up by name only; if the name exists under both wire formats the
    /// lower-priority value wins, matching explicit-override resolution.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<ProviderConfig>> {
        let snapshot = self.snapshot();
        let mut matches: Vec<&Arc<ProviderConfig>> =
            snapshot.iter().filter(|p| p.name == name).collect();
        matches.sort_by_key(|p| p.priority);
        matches.first().map(|p| Arc::clone(p))
    }

    /// Replace the whole provider list (runtime reconfiguration).
    pub fn replace(&self, providers: Vec<ProviderConfig>) {
        let next = Arc::new(providers.into_iter().map(Arc::new).collect::<Vec<_>>());
        *self.providers.write().unwrap_or_else(|e| e.into_inner()) = next;
        self.notify();
    }

    /// Enable or disable one provider. Returns false if the identity is unknown.
    pub fn set_enabled(&self, key: &ProviderKey, enabled: bool) -> bool {
        let mut guard = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<Arc<ProviderConfig>> = guard.as_ref().clone();
        let mut found = false;
        for slot in next.iter_mut() {
            if slot.key() == *key {
                let mut updated = slot.as_ref().clone();
                updated.enabled = enabled;
                *slot = Arc::new(updated);
                found = true;
            }
        }
        if found {
            *guard = Arc::new(next);
            drop(guard);
            tracing::info!(provider = %key, enabled, "provider availability changed");
            self.notify();
        }
        found
    }

    /// Subscribe to change notifications. The value is a generation counter;
    /// receivers should re-read `snapshot()` when it changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|gen| *gen = gen.wrapping_add(1));
    }
}
