//! HA / ANA state machine.
//!
//! The clustered controller assigns ANA groups to gateways; per (gateway,
//! group) the machine is a two-state toggle INACCESSIBLE <-> OPTIMIZED.
//! Assignments apply to every subsystem this gateway serves. Transitions are
//! written to the engine in the exact order they arrive, serialized under the
//! engine lock; failover and failback are nothing more than the controller
//! handing groups around.

use crate::{
    context::GwContext,
    error::SvcError,
    state::{
        keys::{ana_groups_prefix, StateKey},
        map::{StateMap, Versioned},
        records::{AnaGroupRecord, AnaState, ListenerRecord},
    },
    tgt::{types::ListenAddress, TgtClient},
};
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info, warn};

/// Set of groups this gateway currently advertises as optimized.
#[derive(Debug, Default)]
pub struct AnaGroups {
    optimized: RwLock<BTreeSet<u32>>,
}

impl AnaGroups {
    pub fn snapshot(&self) -> BTreeSet<u32> {
        self.optimized.read().clone()
    }

    pub fn is_optimized(&self, grp: u32) -> bool {
        self.optimized.read().contains(&grp)
    }

    fn insert(&self, grp: u32) {
        self.optimized.write().insert(grp);
    }

    fn remove(&self, grp: u32) {
        self.optimized.write().remove(&grp);
    }
}

/// One controller assignment change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnaAssignment {
    pub grp: u32,
    pub state: AnaState,
}

/// Applies controller assignments to the local engine and records group
/// ownership in the state map.
pub struct AnaMachine {
    tgt: Arc<TgtClient>,
    state: Arc<StateMap>,
    ana: Arc<AnaGroups>,
    gw_name: String,
}

impl AnaMachine {
    pub fn new(ctx: &GwContext) -> Self {
        Self {
            tgt: ctx.tgt.clone(),
            state: ctx.state.clone(),
            ana: ctx.ana.clone(),
            gw_name: ctx.gw_name().to_string(),
        }
    }

    /// Apply one assignment. Must be called in arrival order by a single
    /// consumer; the engine lock keeps transitions from interleaving with
    /// other engine mutations.
    pub async fn handle(&self, ev: AnaAssignment) -> Result<(), SvcError> {
        let _engine = self.tgt.lock().await;
        info!(
            "ANA group {} becomes {} on gateway {}",
            ev.grp, ev.state, self.gw_name
        );
        match ev.state {
            AnaState::Optimized => {
                self.advertise(ev.grp, AnaState::Optimized).await?;
                self.ana.insert(ev.grp);
                self.record_owner(ev.grp, Some(self.gw_name.clone())).await;
            }
            AnaState::Inaccessible => {
                // inaccessible goes out first so the engine asks hosts whose
                // namespaces live in this group to disconnect
                self.advertise(ev.grp, AnaState::Inaccessible).await?;
                self.ana.remove(ev.grp);
                self.record_owner(ev.grp, None).await;
            }
        }
        Ok(())
    }

    /// Advertise one group state on every listener this gateway realizes.
    async fn advertise(
        &self,
        grp: u32,
        state: AnaState,
    ) -> Result<(), SvcError> {
        let snapshot = self.state.store().snapshot().await.map_err(
            SvcError::from,
        )?;
        for (key, record) in snapshot.with_prefix("lst/") {
            let listener: ListenerRecord =
                match serde_json::from_value(record.payload.clone()) {
                    Ok(listener) => listener,
                    Err(err) => {
                        warn!("Skipping undecodable listener {}: {}", key, err);
                        continue;
                    }
                };
            if listener.gateway != self.gw_name {
                continue;
            }
            self.tgt
                .listener_set_ana_state(
                    &listener.nqn,
                    listener_address(&listener),
                    state,
                    grp,
                )
                .await?;
        }
        Ok(())
    }

    /// Advertise the current state of every known group on a freshly created
    /// listener. Caller holds the engine lock.
    pub async fn apply_listener(
        &self,
        nqn: &str,
        address: ListenAddress,
    ) -> Result<(), SvcError> {
        for grp in self.cluster_groups().await? {
            let state = if self.ana.is_optimized(grp) {
                AnaState::Optimized
            } else {
                AnaState::Inaccessible
            };
            self.tgt
                .listener_set_ana_state(nqn, address.clone(), state, grp)
                .await?;
        }
        Ok(())
    }

    /// Every ANA group present in the cluster: the ownership records plus the
    /// load-balancing groups referenced by namespaces.
    async fn cluster_groups(&self) -> Result<BTreeSet<u32>, SvcError> {
        let snapshot =
            self.state.store().snapshot().await.map_err(SvcError::from)?;
        let mut groups = self.ana.snapshot();
        for (key, _) in snapshot.with_prefix(ana_groups_prefix()) {
            if let Ok(StateKey::AnaGroup { grp }) = key.parse() {
                groups.insert(grp);
            }
        }
        for (_, record) in snapshot.with_prefix("ns/") {
            if let Some(grp) = record
                .payload
                .get("anagrpid")
                .and_then(|v| v.as_u64())
            {
                groups.insert(grp as u32);
            }
        }
        Ok(groups)
    }

    /// Record (or clear) this gateway as the owner of a group. Losing the CAS
    /// race is harmless, the controller converges ownership; it is only
    /// logged.
    async fn record_owner(&self, grp: u32, owner: Option<String>) {
        let key = StateKey::AnaGroup { grp };
        let current: Result<Option<Versioned<AnaGroupRecord>>, _> =
            self.state.get(&key).await;
        let result = match current {
            Ok(Some(existing)) => {
                if owner.is_none() && existing.value.owner.as_deref()
                    != Some(self.gw_name.as_str())
                {
                    // another gateway took the group over already
                    return;
                }
                self.state
                    .update(
                        &key,
                        existing.version,
                        &AnaGroupRecord { grp, owner },
                    )
                    .await
                    .map(|_| ())
            }
            Ok(None) => self
                .state
                .create(&key, &AnaGroupRecord { grp, owner })
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("Could not record ANA owner of group {}: {}", grp, err);
        }
    }
}

/// Engine address triple of a listener record.
pub fn listener_address(listener: &ListenerRecord) -> ListenAddress {
    ListenAddress {
        trtype: listener.transport.to_uppercase(),
        adrfam: listener.adrfam.tgt_name().to_string(),
        traddr: listener.traddr.clone(),
        trsvcid: listener.trsvcid.to_string(),
    }
}
