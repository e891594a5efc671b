//! In-memory implementation of the state map. Used by the test suites; it
//! keeps the exact CAS, watch and advisory lock semantics of the backing
//! store so several gateway instances can share one map in-process.

use crate::store::store_defs::{
    ChangeEvent,
    Record,
    Snapshot,
    StateStore,
    StoreError,
    StoreLockGuard,
    TxnOp,
    WatchStream,
    WATCH_BUFFER,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct MemInner {
    entries: BTreeMap<String, Record>,
    epoch: u64,
}

/// Shared in-memory state map.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
    tx: broadcast::Sender<ChangeEvent>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(MemInner::default())),
            tx,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn emit(&self, epoch: u64, key: String, record: Option<Record>) {
        // no receivers is fine, the reconciler may not be running yet
        let _ = self.tx.send(ChangeEvent { epoch, key, record });
    }

    fn check_guard(
        inner: &MemInner,
        key: &str,
        expected: u64,
    ) -> Result<(), StoreError> {
        let current = inner.entries.get(key).map(|r| r.version).unwrap_or(0);
        if current != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
            });
        }
        Ok(())
    }
}

struct MemLockGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait]
impl StoreLockGuard for MemLockGuard {
    async fn unlock(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemStore {
    async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let inner = self.inner.lock();
        Ok(Snapshot {
            epoch: inner.epoch,
            entries: inner
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn cas(
        &self,
        key: &str,
        expected: u64,
        writer: &str,
        payload: Value,
    ) -> Result<u64, StoreError> {
        let (epoch, record) = {
            let mut inner = self.inner.lock();
            Self::check_guard(&inner, key, expected)?;
            let record = Record {
                version: expected + 1,
                writer: writer.to_string(),
                payload,
            };
            inner.entries.insert(key.to_string(), record.clone());
            inner.epoch += 1;
            (inner.epoch, record)
        };
        self.emit(epoch, key.to_string(), Some(record));
        Ok(expected + 1)
    }

    async fn delete(
        &self,
        key: &str,
        expected: Option<u64>,
    ) -> Result<(), StoreError> {
        let epoch = {
            let mut inner = self.inner.lock();
            if let Some(expected) = expected {
                Self::check_guard(&inner, key, expected)?;
            }
            if inner.entries.remove(key).is_none() {
                return Ok(());
            }
            inner.epoch += 1;
            inner.epoch
        };
        self.emit(epoch, key.to_string(), None);
        Ok(())
    }

    async fn txn(
        &self,
        writer: &str,
        ops: Vec<TxnOp>,
    ) -> Result<(), StoreError> {
        let mut events = Vec::with_capacity(ops.len());
        {
            let mut inner = self.inner.lock();
            // verify every guard before touching anything
            for op in &ops {
                match op {
                    TxnOp::Put { key, expected, .. } => {
                        Self::check_guard(&inner, key, *expected)?;
                    }
                    TxnOp::Delete {
                        key,
                        expected: Some(expected),
                    } => {
                        Self::check_guard(&inner, key, *expected)?;
                    }
                    TxnOp::Delete { .. } => {}
                }
            }
            for op in ops {
                match op {
                    TxnOp::Put {
                        key,
                        expected,
                        payload,
                    } => {
                        let record = Record {
                            version: expected + 1,
                            writer: writer.to_string(),
                            payload,
                        };
                        inner.entries.insert(key.clone(), record.clone());
                        inner.epoch += 1;
                        events.push((inner.epoch, key, Some(record)));
                    }
                    TxnOp::Delete { key, .. } => {
                        if inner.entries.remove(&key).is_some() {
                            inner.epoch += 1;
                            events.push((inner.epoch, key, None));
                        }
                    }
                }
            }
        }
        for (epoch, key, record) in events {
            self.emit(epoch, key, record);
        }
        Ok(())
    }

    fn watch(&self) -> WatchStream {
        WatchStream::new(self.tx.subscribe())
    }

    async fn lock(&self) -> Result<Box<dyn StoreLockGuard>, StoreError> {
        let guard = self.lock.clone().lock_owned().await;
        Ok(Box::new(MemLockGuard { _guard: guard }))
    }

    async fn online(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn cas_creates_and_bumps_versions() {
        let store = MemStore::new();
        let v1 = store.cas("sub/a", 0, "gw1", json!({"x": 1})).await.unwrap();
        assert_eq!(v1, 1);
        let v2 = store.cas("sub/a", 1, "gw1", json!({"x": 2})).await.unwrap();
        assert_eq!(v2, 2);

        let err = store.cas("sub/a", 1, "gw2", json!({})).await.unwrap_err();
        assert_matches!(err, StoreError::VersionConflict { .. });
    }

    #[tokio::test]
    async fn delete_honours_version_guard() {
        let store = MemStore::new();
        store.cas("k", 0, "gw1", json!(1)).await.unwrap();
        let err = store.delete("k", Some(5)).await.unwrap_err();
        assert_matches!(err, StoreError::VersionConflict { .. });
        store.delete("k", Some(1)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        // unconditional delete of a missing key is a no-op
        store.delete("k", None).await.unwrap();
    }

    #[tokio::test]
    async fn txn_is_all_or_nothing() {
        let store = MemStore::new();
        store.cas("a", 0, "gw1", json!(1)).await.unwrap();

        let err = store
            .txn(
                "gw1",
                vec![
                    TxnOp::Delete {
                        key: "a".into(),
                        expected: Some(1),
                    },
                    TxnOp::Put {
                        key: "b".into(),
                        expected: 7, // wrong guard
                        payload: json!(2),
                    },
                ],
            )
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::VersionConflict { .. });
        // nothing was applied
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_delivers_ordered_changes() {
        let store = MemStore::new();
        let mut watch = store.watch();
        store.cas("sub/a", 0, "gw1", json!(1)).await.unwrap();
        store.delete("sub/a", None).await.unwrap();

        match watch.recv().await {
            crate::store::store_defs::WatchMsg::Event(ev) => {
                assert_eq!(ev.key, "sub/a");
                assert!(ev.record.is_some());
            }
            other => panic!("unexpected watch message {:?}", other),
        }
        match watch.recv().await {
            crate::store::store_defs::WatchMsg::Event(ev) => {
                assert_eq!(ev.key, "sub/a");
                assert!(ev.record.is_none());
            }
            other => panic!("unexpected watch message {:?}", other),
        }
    }

    #[tokio::test]
    async fn snapshot_is_ordered() {
        let store = MemStore::new();
        store.cas("b", 0, "gw", json!(1)).await.unwrap();
        store.cas("a", 0, "gw", json!(1)).await.unwrap();
        let snap = store.snapshot().await.unwrap();
        let keys: Vec<_> =
            snap.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(snap.get("a").is_some());
        assert!(snap.get("zzz").is_none());
    }
}
