//! Implementation of the state map on an etcd cluster. Every record lives
//! under a per gateway-group prefix; the per key etcd version is the CAS
//! token and the watch feed is bridged onto the bounded broadcast buffer
//! consumed by the peer reconciler.

use crate::store::store_defs::{
    ChangeEvent,
    ConnectSnafu,
    DeleteSnafu,
    GetSnafu,
    LockSnafu,
    Record,
    SerialiseValueSnafu,
    Snapshot,
    StateStore,
    StoreError,
    StoreLockGuard,
    TxnOp,
    TxnSnafu,
    WatchStream,
    WATCH_BUFFER,
};
use async_trait::async_trait;
use etcd_client::{
    Client,
    Compare,
    CompareOp,
    EventType,
    GetOptions,
    Txn,
    TxnOp as EtcdTxnOp,
    WatchOptions,
};
use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// etcd backed state map.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    prefix: String,
    tx: broadcast::Sender<ChangeEvent>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EtcdStore({})", self.prefix)
    }
}

impl EtcdStore {
    /// Connect to etcd and start the watch bridge. The prefix scopes all keys
    /// of this gateway group, e.g. `nvmeof/group1/`.
    pub async fn new(
        endpoint: &str,
        prefix: &str,
    ) -> Result<EtcdStore, StoreError> {
        let client = Client::connect([endpoint], None)
            .await
            .context(ConnectSnafu {})?;
        let (tx, _) = broadcast::channel(WATCH_BUFFER);

        let store = Self {
            client,
            prefix: prefix.to_string(),
            tx,
        };
        store.spawn_watch_bridge().await?;
        info!("Connected to etcd on endpoint {}", endpoint);
        Ok(store)
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn unscoped(&self, key: &[u8]) -> Option<String> {
        let key = String::from_utf8_lossy(key);
        key.strip_prefix(&self.prefix).map(|k| k.to_string())
    }

    fn encode(record: &Record) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(record).context(SerialiseValueSnafu {})
    }

    fn decode(&self, value: &[u8]) -> Option<Record> {
        match serde_json::from_slice::<Record>(value) {
            Ok(record) => Some(record),
            Err(err) => {
                error!(
                    "Undecodable state map record ({}), skipping: {}",
                    String::from_utf8_lossy(value),
                    err
                );
                None
            }
        }
    }

    /// Feed etcd watch events into the bounded broadcast buffer. Lag on the
    /// consumer side shows up as a `Lagged` marker, which triggers a
    /// resnapshot rather than losing changes silently.
    async fn spawn_watch_bridge(&self) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(
                self.prefix.as_str(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await
            .map_err(|source| StoreError::Connect { source })?;

        let this = self.clone();
        tokio::spawn(async move {
            // the watcher handle must stay alive for the stream to run
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        let epoch = resp
                            .header()
                            .map(|h| h.revision() as u64)
                            .unwrap_or_default();
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Some(key) = this.unscoped(kv.key()) else {
                                continue;
                            };
                            let record = match event.event_type() {
                                EventType::Put => this.decode(kv.value()),
                                EventType::Delete => None,
                            };
                            if event.event_type() == EventType::Put
                                && record.is_none()
                            {
                                continue;
                            }
                            let _ = this.tx.send(ChangeEvent {
                                epoch,
                                key,
                                record,
                            });
                        }
                    }
                    Ok(None) => {
                        warn!("etcd watch stream ended");
                        break;
                    }
                    Err(err) => {
                        error!("etcd watch stream failed: {}", err);
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

struct EtcdLockGuard {
    client: Client,
    key: Vec<u8>,
}

#[async_trait]
impl StoreLockGuard for EtcdLockGuard {
    async fn unlock(self: Box<Self>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.unlock(self.key).await.context(LockSnafu {})?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for EtcdStore {
    async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                self.prefix.as_str(),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .context(GetSnafu {
                key: self.prefix.clone(),
            })?;
        let epoch = resp
            .header()
            .map(|h| h.revision() as u64)
            .unwrap_or_default();
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let Some(key) = self.unscoped(kv.key()) else { continue };
            if let Some(record) = self.decode(kv.value()) {
                entries.push((key, record));
            }
        }
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(Snapshot { epoch, entries })
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.scoped(key), None)
            .await
            .context(GetSnafu { key })?;
        Ok(resp.kvs().first().and_then(|kv| self.decode(kv.value())))
    }

    async fn cas(
        &self,
        key: &str,
        expected: u64,
        writer: &str,
        payload: Value,
    ) -> Result<u64, StoreError> {
        let record = Record {
            version: expected + 1,
            writer: writer.to_string(),
            payload,
        };
        let scoped = self.scoped(key);
        // etcd's per key `version` counts modifications since creation and is
        // 0 for an absent key, which matches the envelope version exactly
        let txn = Txn::new()
            .when(vec![Compare::version(
                scoped.clone(),
                CompareOp::Equal,
                expected as i64,
            )])
            .and_then(vec![EtcdTxnOp::put(
                scoped,
                Self::encode(&record)?,
                None,
            )]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.context(TxnSnafu {})?;
        if !resp.succeeded() {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
            });
        }
        Ok(record.version)
    }

    async fn delete(
        &self,
        key: &str,
        expected: Option<u64>,
    ) -> Result<(), StoreError> {
        let scoped = self.scoped(key);
        let mut client = self.client.clone();
        match expected {
            Some(expected) => {
                let txn = Txn::new()
                    .when(vec![Compare::version(
                        scoped.clone(),
                        CompareOp::Equal,
                        expected as i64,
                    )])
                    .and_then(vec![EtcdTxnOp::delete(scoped, None)]);
                let resp = client.txn(txn).await.context(TxnSnafu {})?;
                if !resp.succeeded() {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected,
                    });
                }
            }
            None => {
                client
                    .delete(scoped, None)
                    .await
                    .context(DeleteSnafu { key })?;
            }
        }
        Ok(())
    }

    async fn txn(
        &self,
        writer: &str,
        ops: Vec<TxnOp>,
    ) -> Result<(), StoreError> {
        let mut compares = Vec::new();
        let mut actions = Vec::new();
        for op in &ops {
            match op {
                TxnOp::Put {
                    key,
                    expected,
                    payload,
                } => {
                    let scoped = self.scoped(key);
                    compares.push(Compare::version(
                        scoped.clone(),
                        CompareOp::Equal,
                        *expected as i64,
                    ));
                    let record = Record {
                        version: expected + 1,
                        writer: writer.to_string(),
                        payload: payload.clone(),
                    };
                    actions.push(EtcdTxnOp::put(
                        scoped,
                        Self::encode(&record)?,
                        None,
                    ));
                }
                TxnOp::Delete { key, expected } => {
                    let scoped = self.scoped(key);
                    if let Some(expected) = expected {
                        compares.push(Compare::version(
                            scoped.clone(),
                            CompareOp::Equal,
                            *expected as i64,
                        ));
                    }
                    actions.push(EtcdTxnOp::delete(scoped, None));
                }
            }
        }
        let txn = Txn::new().when(compares).and_then(actions);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.context(TxnSnafu {})?;
        if !resp.succeeded() {
            return Err(StoreError::VersionConflict {
                key: "<txn>".to_string(),
                expected: 0,
            });
        }
        Ok(())
    }

    fn watch(&self) -> WatchStream {
        WatchStream::new(self.tx.subscribe())
    }

    async fn lock(&self) -> Result<Box<dyn StoreLockGuard>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .lock(format!("{}lock", self.prefix), None)
            .await
            .context(LockSnafu {})?;
        Ok(Box::new(EtcdLockGuard {
            client: self.client.clone(),
            key: resp.key().to_vec(),
        }))
    }

    async fn online(&self) -> bool {
        let mut client = self.client.clone();
        client.status().await.is_ok()
    }
}
