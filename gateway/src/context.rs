//! Typed handles shared by every component of the gateway. The context is
//! built once at startup and passed by `Arc`; there are no process globals.

use crate::{
    config::GwConfig,
    core::lock::SubsystemLocks,
    ha::AnaGroups,
    keyring::Keyring,
    state::map::StateMap,
    tgt::TgtClient,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Health flag of the gateway, lowered by the reconciler when local engine
/// state persistently diverges from the state map, raised again once it
/// converges. Read by the monitor heartbeat and `gw_get_info`.
#[derive(Debug, Default)]
pub struct Health {
    degraded: AtomicBool,
}

impl Health {
    pub fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn set_healthy(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        !self.degraded.load(Ordering::Relaxed)
    }
}

/// Keys whose state map write succeeded but whose local engine apply failed;
/// the reconciler picks these up instead of skipping the self-authored event.
#[derive(Debug, Default)]
pub struct PendingApplies {
    keys: Mutex<HashSet<String>>,
}

impl PendingApplies {
    pub fn mark(&self, key: impl Into<String>) {
        self.keys.lock().insert(key.into());
    }

    pub fn clear(&self, key: &str) -> bool {
        self.keys.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

/// Shared handles of one gateway instance.
pub struct GwContext {
    pub config: Arc<GwConfig>,
    pub tgt: Arc<TgtClient>,
    pub state: Arc<StateMap>,
    pub locks: Arc<SubsystemLocks>,
    pub keyring: Arc<Keyring>,
    pub ana: Arc<AnaGroups>,
    pub health: Arc<Health>,
    pub pending: Arc<PendingApplies>,
}

impl GwContext {
    /// Name of this gateway (the writer identity in the state map).
    pub fn gw_name(&self) -> &str {
        &self.config.gateway.name
    }
}
