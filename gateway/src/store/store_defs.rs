//! Definition of a trait for the cluster state map together with its error
//! codes. The state map is a sorted key to value map shared by every gateway
//! in the group; every value is a versioned envelope and all writes are
//! compare-and-set on the per key version.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Error as SerdeError, Value};
use snafu::Snafu;
use tokio::sync::broadcast;

/// Capacity of the watch fan-out buffer. A consumer that falls further behind
/// than this observes a lag marker and must resnapshot.
pub const WATCH_BUFFER: usize = 1024;

/// Definition of errors that can be returned from the state map.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Failed to connect to the backing store.
    #[snafu(display("Failed to connect to store. Error {}", source))]
    Connect { source: etcd_client::Error },
    /// Failed to 'get' an entry from the store.
    #[snafu(display("Failed to 'get' entry with key {}. Error {}", key, source))]
    Get {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to 'put' an entry in the store.
    #[snafu(display(
        "Failed to 'put' entry with key {}. Error {}",
        key,
        source
    ))]
    Put {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to 'delete' an entry from the store.
    #[snafu(display(
        "Failed to 'delete' entry with key {}. Error {}",
        key,
        source
    ))]
    Delete {
        key: String,
        source: etcd_client::Error,
    },
    /// Failed to run a transaction against the store.
    #[snafu(display("Failed to run store transaction. Error {}", source))]
    Txn { source: etcd_client::Error },
    /// Failed to acquire or release the advisory lock.
    #[snafu(display("Advisory lock failure. Error {}", source))]
    Lock { source: etcd_client::Error },
    /// The compare-and-set found a different version than expected.
    #[snafu(display(
        "Version conflict on key {}: expected version {}",
        key,
        expected
    ))]
    VersionConflict { key: String, expected: u64 },
    /// Failed to find an entry with the given key.
    #[snafu(display("Entry with key {} not found.", key))]
    MissingEntry { key: String },
    /// Failed to deserialise value.
    #[snafu(display("Failed to deserialise value {}. Error {}", value, source))]
    DeserialiseValue { value: String, source: SerdeError },
    /// Failed to serialise value.
    #[snafu(display("Failed to serialise value. Error {}", source))]
    SerialiseValue { source: SerdeError },
    /// Store operation timed out.
    #[snafu(display("Store operation timed out."))]
    OpTimeout {},
    /// The backing store is not reachable.
    #[snafu(display("Store unavailable: {}", details))]
    Unavailable { details: String },
}

/// Versioned envelope stored under every state map key. The version is the
/// CAS token; the writer records which gateway authored the change so peers
/// can recognise their own updates on the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub version: u64,
    pub writer: String,
    pub payload: Value,
}

/// Ordered contents of the state map at one epoch.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Global modification epoch at the time of the read.
    pub epoch: u64,
    /// All entries, ordered by key.
    pub entries: Vec<(String, Record)>,
}

impl Snapshot {
    /// All entries whose key starts with the given prefix.
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a (String, Record)> + 'a {
        self.entries.iter().filter(move |(k, _)| k.starts_with(prefix))
    }

    /// Look up a single key.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }
}

/// One observed change: the record is `None` when the key was deleted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub epoch: u64,
    pub key: String,
    pub record: Option<Record>,
}

/// What a watch consumer receives next.
#[derive(Debug)]
pub enum WatchMsg {
    /// A change, delivered at least once and in order.
    Event(ChangeEvent),
    /// The consumer fell behind and events were dropped; it must resnapshot.
    Lagged,
    /// The store went away.
    Closed,
}

/// A lazy, restartable sequence of change events. Backpressure is a bounded
/// buffer with drop-oldest semantics; an overflow surfaces as `Lagged`.
pub struct WatchStream {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl WatchStream {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> WatchMsg {
        match self.rx.recv().await {
            Ok(ev) => WatchMsg::Event(ev),
            Err(broadcast::error::RecvError::Lagged(_)) => WatchMsg::Lagged,
            Err(broadcast::error::RecvError::Closed) => WatchMsg::Closed,
        }
    }
}

/// One operation of an atomic multi-key write.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write `payload`, guarded on the current version (0 creates).
    Put {
        key: String,
        expected: u64,
        payload: Value,
    },
    /// Delete the key; with a version guard when `expected` is set.
    Delete { key: String, expected: Option<u64> },
}

/// Guard of the store-wide advisory lock, held for the duration of a compound
/// mutation that needs cross-key atomicity.
#[async_trait]
pub trait StoreLockGuard: Send {
    async fn unlock(self: Box<Self>) -> Result<(), StoreError>;
}

/// Trait defining the operations of the cluster state map.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current epoch plus ordered contents.
    async fn snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Read a single record.
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Atomic compare-and-set: succeeds only when the stored version equals
    /// `expected` (0 for creation) and returns the new version.
    async fn cas(
        &self,
        key: &str,
        expected: u64,
        writer: &str,
        payload: Value,
    ) -> Result<u64, StoreError>;

    /// CAS-like delete.
    async fn delete(
        &self,
        key: &str,
        expected: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Apply all operations atomically, or none of them.
    async fn txn(&self, writer: &str, ops: Vec<TxnOp>)
        -> Result<(), StoreError>;

    /// Subscribe to the change feed.
    fn watch(&self) -> WatchStream;

    /// Take the advisory cluster lock.
    async fn lock(&self) -> Result<Box<dyn StoreLockGuard>, StoreError>;

    /// Liveness probe of the backing store.
    async fn online(&self) -> bool;
}
