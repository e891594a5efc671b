//! Typed access to the state map plus the in-memory read cache.
//!
//! Mutations always read and CAS against the backing store; the cache is only
//! ever updated from confirmed change notifications (or a full resnapshot) so
//! readers see exactly the sequence of states the cluster agreed on.

use crate::store::store_defs::{
    ChangeEvent,
    Record,
    Snapshot,
    StateStore,
    StoreError,
    StoreLockGuard,
    TxnOp,
    WatchStream,
};
use crate::state::keys::StateKey;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// A decoded record together with its CAS version.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Debug, Default)]
struct Cache {
    epoch: u64,
    entries: BTreeMap<String, Record>,
}

/// Cluster state map handle owned by one gateway.
pub struct StateMap {
    store: Arc<dyn StateStore>,
    writer: String,
    cache: RwLock<Cache>,
}

impl StateMap {
    pub fn new(store: Arc<dyn StateStore>, writer: impl Into<String>) -> Self {
        Self {
            store,
            writer: writer.into(),
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Name this gateway writes into every record it authors.
    pub fn writer(&self) -> &str {
        &self.writer
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn decode<T: DeserializeOwned>(
        record: &Record,
    ) -> Result<T, StoreError> {
        serde_json::from_value(record.payload.clone()).map_err(|source| {
            StoreError::DeserialiseValue {
                value: record.payload.to_string(),
                source,
            }
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(value)
            .map_err(|source| StoreError::SerialiseValue { source })
    }

    /// Authoritative read of one record.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &StateKey,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        match self.store.get(&key.to_string()).await? {
            Some(record) => Ok(Some(Versioned {
                value: Self::decode(&record)?,
                version: record.version,
            })),
            None => Ok(None),
        }
    }

    /// Authoritative listing of every record under a prefix.
    pub async fn list<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<Versioned<T>>, StoreError> {
        let snapshot = self.store.snapshot().await?;
        let mut out = Vec::new();
        for (_, record) in snapshot.with_prefix(prefix) {
            out.push(Versioned {
                value: Self::decode(record)?,
                version: record.version,
            });
        }
        Ok(out)
    }

    /// Create a record; fails with a version conflict when it exists.
    pub async fn create<T: Serialize>(
        &self,
        key: &StateKey,
        value: &T,
    ) -> Result<u64, StoreError> {
        self.store
            .cas(&key.to_string(), 0, &self.writer, Self::encode(value)?)
            .await
    }

    /// Replace a record at a known version.
    pub async fn update<T: Serialize>(
        &self,
        key: &StateKey,
        expected: u64,
        value: &T,
    ) -> Result<u64, StoreError> {
        self.store
            .cas(
                &key.to_string(),
                expected,
                &self.writer,
                Self::encode(value)?,
            )
            .await
    }

    /// Delete a record, guarded when a version is given.
    pub async fn remove(
        &self,
        key: &StateKey,
        expected: Option<u64>,
    ) -> Result<(), StoreError> {
        self.store.delete(&key.to_string(), expected).await
    }

    /// Atomic multi-key write authored by this gateway.
    pub async fn txn(&self, ops: Vec<TxnOp>) -> Result<(), StoreError> {
        self.store.txn(&self.writer, ops).await
    }

    /// Build a guarded put operation for `txn`.
    pub fn put_op<T: Serialize>(
        key: &StateKey,
        expected: u64,
        value: &T,
    ) -> Result<TxnOp, StoreError> {
        Ok(TxnOp::Put {
            key: key.to_string(),
            expected,
            payload: Self::encode(value)?,
        })
    }

    /// Build a delete operation for `txn`.
    pub fn delete_op(key: &StateKey, expected: Option<u64>) -> TxnOp {
        TxnOp::Delete {
            key: key.to_string(),
            expected,
        }
    }

    /// Take the cluster-wide advisory lock for a compound mutation.
    pub async fn lock(&self) -> Result<Box<dyn StoreLockGuard>, StoreError> {
        self.store.lock().await
    }

    /// Subscribe to the change feed.
    pub fn watch(&self) -> WatchStream {
        self.store.watch()
    }

    /// Resnapshot the backing store and replace the cache.
    pub async fn refresh(&self) -> Result<Snapshot, StoreError> {
        let snapshot = self.store.snapshot().await?;
        let mut cache = self.cache.write();
        cache.epoch = snapshot.epoch;
        cache.entries = snapshot
            .entries
            .iter()
            .cloned()
            .collect::<BTreeMap<_, _>>();
        Ok(snapshot)
    }

    /// Fold one confirmed change notification into the cache.
    pub fn apply_event(&self, event: &ChangeEvent) {
        let mut cache = self.cache.write();
        if event.epoch > cache.epoch {
            cache.epoch = event.epoch;
        }
        match &event.record {
            Some(record) => {
                cache.entries.insert(event.key.clone(), record.clone());
            }
            None => {
                cache.entries.remove(&event.key);
            }
        }
    }

    /// Point-in-time view of the cache, ordered by key.
    pub fn cached_snapshot(&self) -> Snapshot {
        let cache = self.cache.read();
        Snapshot {
            epoch: cache.epoch,
            entries: cache
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::records::SubsystemRecord;
    use crate::store::mem::MemStore;

    fn subsystem(nqn: &str) -> SubsystemRecord {
        SubsystemRecord {
            nqn: nqn.to_string(),
            serial: "SPDK00000001".to_string(),
            max_namespaces: 256,
            allow_any_host: false,
            created_without_group_append: true,
        }
    }

    #[tokio::test]
    async fn typed_roundtrip() {
        let map = StateMap::new(Arc::new(MemStore::new()), "gw-1");
        let key = StateKey::Subsystem {
            nqn: "nqn.2016-06.io.spdk:cnode1".into(),
        };
        let rec = subsystem("nqn.2016-06.io.spdk:cnode1");
        let version = map.create(&key, &rec).await.unwrap();
        assert_eq!(version, 1);

        let got: Versioned<SubsystemRecord> =
            map.get(&key).await.unwrap().unwrap();
        assert_eq!(got.value, rec);
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn cache_follows_events() {
        let store = Arc::new(MemStore::new());
        let map = StateMap::new(store.clone(), "gw-1");
        let mut watch = map.watch();

        let key = StateKey::Subsystem {
            nqn: "nqn.2016-06.io.spdk:cnode1".into(),
        };
        map.create(&key, &subsystem("nqn.2016-06.io.spdk:cnode1"))
            .await
            .unwrap();

        match watch.recv().await {
            crate::store::store_defs::WatchMsg::Event(ev) => {
                map.apply_event(&ev);
            }
            other => panic!("unexpected watch message {:?}", other),
        }
        let snap = map.cached_snapshot();
        assert!(snap.get(&key.to_string()).is_some());
    }
}
