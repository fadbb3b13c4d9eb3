// SPDX-License-Identifier: BUSL-1.1

//! Global connection registry: every admitted client, independent of what
//! it's subscribed to. Backs the connection count used by admission and
//! `/healthz`, and gives shutdown a way to enumerate clients to drain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::client::Client;

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self { clients: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, client: Arc<Client>) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.insert(client.id.clone(), client);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Client>> {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every currently-registered client, for shutdown drain.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;

    #[test]
    fn insert_then_remove_tracks_count() {
        let registry = ClientRegistry::new();
        let client = Arc::new(Client::new_for_test("a", &FanoutConfig::default()));
        registry.insert(client.clone());
        assert_eq!(registry.len(), 1);
        registry.remove("a");
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn snapshot_reflects_current_membership() {
        let registry = ClientRegistry::new();
        registry.insert(Arc::new(Client::new_for_test("a", &FanoutConfig::default())));
        registry.insert(Arc::new(Client::new_for_test("b", &FanoutConfig::default())));
        assert_eq!(registry.snapshot().len(), 2);
    }
}
