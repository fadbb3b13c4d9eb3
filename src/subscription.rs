// SPDX-License-Identifier: BUSL-1.1

//! Subscription Index: the channel -> subscriber-list map the Broadcast
//! Engine reads on every event, and the Read Pipe mutates on
//! subscribe/unsubscribe.
//!
//! Reads take the `RwLock` only long enough to clone an `Arc` snapshot of
//! the subscriber list, never across an `.await` point or I/O. Writes
//! (subscribe/unsubscribe) replace the whole list rather than mutate it in
//! place, so a reader holding an old snapshot never observes a half-built
//! list.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::client::Client;

#[derive(Default)]
pub struct SubscriptionIndex {
    channels: RwLock<HashMap<String, Arc<Vec<Arc<Client>>>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self { channels: RwLock::new(HashMap::new()) }
    }

    /// Snapshot the current subscriber list for a channel. Returns `None`
    /// for an unknown channel rather than an empty `Vec`, so callers can
    /// distinguish "no channel" from "channel with zero subscribers".
    pub fn get(&self, channel: &str) -> Option<Arc<Vec<Arc<Client>>>> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).cloned()
    }

    pub fn add(&self, channel: &str, client: Arc<Client>) {
        self.add_many(std::iter::once(channel), client)
    }

    /// Subscribe one client to several channels under a single write-lock
    /// acquisition, matching the Read Pipe's batched-subscribe control
    /// message.
    pub fn add_many<'a>(&self, channels_iter: impl Iterator<Item = &'a str>, client: Arc<Client>) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        for channel in channels_iter {
            let next = match channels.get(channel) {
                Some(existing) if existing.iter().any(|c| Arc::ptr_eq(c, &client)) => continue,
                Some(existing) => {
                    let mut list = (**existing).clone();
                    list.push(client.clone());
                    list
                }
                None => vec![client.clone()],
            };
            channels.insert(channel.to_owned(), Arc::new(next));
        }
    }

    pub fn remove(&self, channel: &str, client: &Arc<Client>) {
        self.remove_many(std::iter::once(channel), client)
    }

    pub fn remove_many<'a>(&self, channels_iter: impl Iterator<Item = &'a str>, client: &Arc<Client>) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        for channel in channels_iter {
            if let Some(existing) = channels.get(channel) {
                let next: Vec<Arc<Client>> =
                    existing.iter().filter(|c| !Arc::ptr_eq(c, client)).cloned().collect();
                if next.is_empty() {
                    channels.remove(channel);
                } else {
                    channels.insert(channel.to_owned(), Arc::new(next));
                }
            }
        }
    }

    /// Remove a client from every channel it's subscribed to. Called once
    /// at teardown; O(channels) but teardown is off the hot path.
    pub fn remove_client(&self, client: &Arc<Client>) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        for list in channels.values_mut() {
            if list.iter().any(|c| Arc::ptr_eq(c, client)) {
                let next: Vec<Arc<Client>> =
                    list.iter().filter(|c| !Arc::ptr_eq(c, client)).cloned().collect();
                *list = Arc::new(next);
            }
        }
        channels.retain(|_, list| !list.is_empty());
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;

    fn test_client(id: &str) -> Arc<Client> {
        Arc::new(Client::new_for_test(id, &FanoutConfig::default()))
    }

    #[test]
    fn add_then_get_returns_subscriber() {
        let index = SubscriptionIndex::new();
        let client = test_client("a");
        index.add("trade.sol.usdc", client.clone());
        let snapshot = index.get("trade.sol.usdc").expect("channel exists");
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(&snapshot[0], &client));
    }

    #[test]
    fn unknown_channel_returns_none() {
        let index = SubscriptionIndex::new();
        assert!(index.get("nope").is_none());
    }

    #[test]
    fn duplicate_add_is_noop() {
        let index = SubscriptionIndex::new();
        let client = test_client("a");
        index.add("c1", client.clone());
        index.add("c1", client.clone());
        assert_eq!(index.get("c1").unwrap().len(), 1);
    }

    #[test]
    fn remove_drops_empty_channel() {
        let index = SubscriptionIndex::new();
        let client = test_client("a");
        index.add("c1", client.clone());
        index.remove("c1", &client);
        assert!(index.get("c1").is_none());
        assert_eq!(index.channel_count(), 0);
    }

    #[test]
    fn remove_client_clears_all_channels() {
        let index = SubscriptionIndex::new();
        let client = test_client("a");
        index.add_many(["c1", "c2", "c3"].into_iter(), client.clone());
        index.remove_client(&client);
        assert_eq!(index.channel_count(), 0);
    }

    #[test]
    fn snapshot_is_stable_under_concurrent_mutation() {
        let index = SubscriptionIndex::new();
        let a = test_client("a");
        index.add("c1", a.clone());
        let snapshot = index.get("c1").unwrap();
        let b = test_client("b");
        index.add("c1", b);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(index.get("c1").unwrap().len(), 2);
    }
}
