//! Subscription records and their indexed store.
//!
//! Records are keyed by subscription id with two secondary indices: by
//! provider participant (cascaded removal on provider unregister) and by
//! `(provider, event name)` (multicast fan-out). Persistence is optional;
//! without a backend the store is purely in-memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::qos::SubscriptionQos;
use crate::persistence::KeyValueStore;

/// What a subscription record subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Attribute,
    SelectiveBroadcast,
    Multicast,
}

/// One subscription known to the publication manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub kind: SubscriptionKind,
    pub subscriber_participant_id: String,
    pub provider_participant_id: String,
    /// Attribute or broadcast (event) name.
    pub name: String,
    pub qos: SubscriptionQos,
    #[serde(default)]
    pub filter_parameters: HashMap<String, String>,
    /// Partition pattern for multicast subscriptions.
    #[serde(default)]
    pub partitions: Vec<String>,
}

/// Indexed container of subscription records.
pub struct SubscriptionStore {
    by_id: HashMap<String, SubscriptionRecord>,
    by_provider: HashMap<String, HashSet<String>>,
    by_provider_event: HashMap<(String, String), HashSet<String>>,
    persistence: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore")
            .field("subscriptions", &self.by_id.len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl SubscriptionStore {
    pub fn new(persistence: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            by_id: HashMap::new(),
            by_provider: HashMap::new(),
            by_provider_event: HashMap::new(),
            persistence,
        }
    }

    /// Restore records from the persistence backend, if any.
    ///
    /// Unreadable entries are skipped with a log line rather than failing
    /// the whole load.
    pub fn restore(&mut self) -> usize {
        let Some(persistence) = self.persistence.clone() else {
            return 0;
        };
        let entries = match persistence.load() {
            Ok(entries) => entries,
            Err(error) => {
                log::error!("[SubscriptionStore] restore failed: {error}");
                return 0;
            }
        };
        let mut restored = 0;
        for (key, raw) in entries {
            match serde_json::from_slice::<SubscriptionRecord>(&raw) {
                Ok(record) => {
                    self.index(&record);
                    self.by_id.insert(record.subscription_id.clone(), record);
                    restored += 1;
                }
                Err(error) => {
                    log::warn!("[SubscriptionStore] skipping unreadable record {key}: {error}");
                }
            }
        }
        restored
    }

    /// Insert or replace a record (same id = subscription update).
    pub fn insert(&mut self, record: SubscriptionRecord) {
        if let Some(previous) = self.by_id.remove(&record.subscription_id) {
            self.unindex(&previous);
        }
        self.index(&record);
        if let Some(persistence) = &self.persistence {
            match serde_json::to_vec(&record) {
                Ok(raw) => {
                    if let Err(error) = persistence.save(&record.subscription_id, &raw) {
                        log::error!(
                            "[SubscriptionStore] persisting {} failed: {error}",
                            record.subscription_id
                        );
                    }
                }
                Err(error) => {
                    log::error!(
                        "[SubscriptionStore] serializing {} failed: {error}",
                        record.subscription_id
                    );
                }
            }
        }
        self.by_id.insert(record.subscription_id.clone(), record);
    }

    pub fn get(&self, subscription_id: &str) -> Option<&SubscriptionRecord> {
        self.by_id.get(subscription_id)
    }

    pub fn remove(&mut self, subscription_id: &str) -> Option<SubscriptionRecord> {
        let record = self.by_id.remove(subscription_id)?;
        self.unindex(&record);
        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.remove(subscription_id) {
                log::error!(
                    "[SubscriptionStore] removing {subscription_id} from persistence failed: {error}"
                );
            }
        }
        Some(record)
    }

    /// Ids of every subscription against `provider_participant_id`.
    pub fn ids_for_provider(&self, provider_participant_id: &str) -> Vec<String> {
        self.by_provider
            .get(provider_participant_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of subscriptions against `(provider, event name)`.
    pub fn ids_for_provider_event(
        &self,
        provider_participant_id: &str,
        name: &str,
    ) -> Vec<String> {
        self.by_provider_event
            .get(&(provider_participant_id.to_owned(), name.to_owned()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn index(&mut self, record: &SubscriptionRecord) {
        self.by_provider
            .entry(record.provider_participant_id.clone())
            .or_default()
            .insert(record.subscription_id.clone());
        self.by_provider_event
            .entry((
                record.provider_participant_id.clone(),
                record.name.clone(),
            ))
            .or_default()
            .insert(record.subscription_id.clone());
    }

    fn unindex(&mut self, record: &SubscriptionRecord) {
        if let Some(ids) = self.by_provider.get_mut(&record.provider_participant_id) {
            ids.remove(&record.subscription_id);
            if ids.is_empty() {
                self.by_provider.remove(&record.provider_participant_id);
            }
        }
        let key = (
            record.provider_participant_id.clone(),
            record.name.clone(),
        );
        if let Some(ids) = self.by_provider_event.get_mut(&key) {
            ids.remove(&record.subscription_id);
            if ids.is_empty() {
                self.by_provider_event.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FileStore;

    fn record(id: &str, provider: &str, name: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: id.to_owned(),
            kind: SubscriptionKind::Attribute,
            subscriber_participant_id: "proxy".to_owned(),
            provider_participant_id: provider.to_owned(),
            name: name.to_owned(),
            qos: SubscriptionQos::on_change(10_000, 1_000, 0),
            filter_parameters: HashMap::new(),
            partitions: Vec::new(),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut store = SubscriptionStore::new(None);
        store.insert(record("s1", "prov", "location"));
        assert!(store.get("s1").is_some());
        assert!(store.remove("s1").is_some());
        assert!(store.get("s1").is_none());
        assert!(store.remove("s1").is_none());
    }

    #[test]
    fn test_provider_index_cascades() {
        let mut store = SubscriptionStore::new(None);
        store.insert(record("s1", "prov-a", "location"));
        store.insert(record("s2", "prov-a", "speed"));
        store.insert(record("s3", "prov-b", "location"));

        let mut ids = store.ids_for_provider("prov-a");
        ids.sort();
        assert_eq!(ids, ["s1", "s2"]);
        assert_eq!(store.ids_for_provider("prov-b"), ["s3"]);

        store.remove("s1");
        assert_eq!(store.ids_for_provider("prov-a"), ["s2"]);
    }

    #[test]
    fn test_provider_event_index() {
        let mut store = SubscriptionStore::new(None);
        store.insert(record("s1", "prov", "location"));
        store.insert(record("s2", "prov", "location"));
        store.insert(record("s3", "prov", "speed"));

        let mut ids = store.ids_for_provider_event("prov", "location");
        ids.sort();
        assert_eq!(ids, ["s1", "s2"]);
    }

    #[test]
    fn test_same_id_insert_is_update() {
        let mut store = SubscriptionStore::new(None);
        store.insert(record("s1", "prov", "location"));
        store.insert(record("s1", "prov", "speed"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("s1").unwrap().name, "speed");
        assert!(store.ids_for_provider_event("prov", "location").is_empty());
        assert_eq!(store.ids_for_provider_event("prov", "speed"), ["s1"]);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("subscriptions.persist");
        {
            let backend = Arc::new(FileStore::open(path.clone()).unwrap());
            let mut store = SubscriptionStore::new(Some(backend));
            store.insert(record("s1", "prov", "location"));
            store.insert(record("s2", "prov", "speed"));
            store.remove("s2");
        }
        let backend = Arc::new(FileStore::open(path).unwrap());
        let mut store = SubscriptionStore::new(Some(backend));
        assert_eq!(store.restore(), 1);
        assert!(store.get("s1").is_some());
        assert!(store.get("s2").is_none());
        assert_eq!(store.ids_for_provider("prov"), ["s1"]);
    }

    #[test]
    fn test_no_persistence_is_legal() {
        let mut store = SubscriptionStore::new(None);
        assert_eq!(store.restore(), 0);
        store.insert(record("s1", "prov", "location"));
        assert_eq!(store.len(), 1);
    }
}
