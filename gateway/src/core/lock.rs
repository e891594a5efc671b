//! Lock manager protecting configuration mutations.
//!
//! Per-subsystem locks come out of a fixed pool of mutexes indexed by a hash
//! of the NQN; an operation that touches two subsystems acquires the two
//! slots in index order so lock acquisition can never deadlock.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use futures::lock::{Mutex, MutexGuard};

/// Number of mutex slots; collisions only cost unrelated serialization.
const DEFAULT_SLOTS: usize = 64;

/// Automatically releases the lock once dropped.
pub struct ResourceLockGuard<'a> {
    _lock_guard: MutexGuard<'a, LockStats>,
}

/// Guards of both subsystems of a two-subsystem operation.
pub struct PairLockGuard<'a> {
    _first: ResourceLockGuard<'a>,
    _second: Option<ResourceLockGuard<'a>>,
}

/// Structure that holds per-lock statistics.
#[derive(Debug, Default)]
struct LockStats {
    num_acquires: usize,
}

/// Pool of named resource locks.
pub struct SubsystemLocks {
    slots: Vec<Mutex<LockStats>>,
}

impl Default for SubsystemLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

async fn acquire_lock(
    lock: &Mutex<LockStats>,
    wait_timeout: Option<Duration>,
) -> Option<ResourceLockGuard<'_>> {
    let mut lock_guard = if let Some(d) = wait_timeout {
        match tokio::time::timeout(d, lock.lock()).await {
            Err(_) => return None,
            Ok(g) => g,
        }
    } else {
        // No timeout, wait for the lock indefinitely.
        lock.lock().await
    };

    lock_guard.num_acquires += 1;

    Some(ResourceLockGuard {
        _lock_guard: lock_guard,
    })
}

impl SubsystemLocks {
    pub fn new(slots: usize) -> Self {
        let slots = std::iter::repeat_with(|| Mutex::new(LockStats::default()))
            .take(slots)
            .collect::<Vec<_>>();
        Self { slots }
    }

    fn slot_of(&self, id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish() as usize % self.slots.len()
    }

    /// Lock one subsystem by NQN.
    pub async fn lock(&self, nqn: &str) -> ResourceLockGuard<'_> {
        acquire_lock(&self.slots[self.slot_of(nqn)], None)
            .await
            .expect("untimed lock acquisition cannot fail")
    }

    /// Lock one subsystem, giving up after the timeout.
    pub async fn lock_timeout(
        &self,
        nqn: &str,
        wait_timeout: Duration,
    ) -> Option<ResourceLockGuard<'_>> {
        acquire_lock(&self.slots[self.slot_of(nqn)], Some(wait_timeout)).await
    }

    /// Lock two subsystems in slot order. When both NQNs hash onto the same
    /// slot a single acquisition covers them.
    pub async fn lock_pair(&self, a: &str, b: &str) -> PairLockGuard<'_> {
        let (lo, hi) = {
            let (sa, sb) = (self.slot_of(a), self.slot_of(b));
            if sa <= sb {
                (sa, sb)
            } else {
                (sb, sa)
            }
        };
        let first = acquire_lock(&self.slots[lo], None)
            .await
            .expect("untimed lock acquisition cannot fail");
        let second = if hi != lo {
            Some(
                acquire_lock(&self.slots[hi], None)
                    .await
                    .expect("untimed lock acquisition cannot fail"),
            )
        } else {
            None
        };
        PairLockGuard {
            _first: first,
            _second: second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn serializes_same_subsystem() {
        let locks = Arc::new(SubsystemLocks::default());
        let guard = locks.lock("nqn.2016-06.io.spdk:cnode1").await;
        // the same nqn must not be lockable while held
        assert!(locks
            .lock_timeout(
                "nqn.2016-06.io.spdk:cnode1",
                Duration::from_millis(50)
            )
            .await
            .is_none());
        drop(guard);
        assert!(locks
            .lock_timeout(
                "nqn.2016-06.io.spdk:cnode1",
                Duration::from_millis(50)
            )
            .await
            .is_some());
    }

    #[tokio::test]
    async fn pair_lock_is_order_independent() {
        let locks = Arc::new(SubsystemLocks::default());
        // both orders must settle without deadlock
        for _ in 0 .. 16 {
            let l1 = locks.clone();
            let l2 = locks.clone();
            let t1 = tokio::spawn(async move {
                let _g = l1.lock_pair("nqn.a", "nqn.b").await;
            });
            let t2 = tokio::spawn(async move {
                let _g = l2.lock_pair("nqn.b", "nqn.a").await;
            });
            tokio::time::timeout(Duration::from_secs(5), async {
                t1.await.unwrap();
                t2.await.unwrap();
            })
            .await
            .expect("pair locking deadlocked");
        }
    }

    #[tokio::test]
    async fn pair_lock_same_slot() {
        let locks = Arc::new(SubsystemLocks::new(1));
        // with a single slot both nqns collide; must still not deadlock
        let _g = locks.lock_pair("nqn.a", "nqn.b").await;
    }
}
