//! Peer reconciler: the single consumer of the state map watch feed.
//!
//! Every gateway's engine is a derived projection of the state map. Changes
//! authored locally were already applied by the service handlers (unless
//! their engine step failed, which leaves a pending marker); everything else
//! is applied here, in watch-receive order. Errors back off exponentially
//! and raise the health flag, they are never surfaced to any API caller. A
//! lagged watch buffer is recovered with a full resnapshot-and-converge.

use crate::{
    context::GwContext,
    error::SvcError,
    ha::{listener_address, AnaMachine},
    service::namespace::bdev_name,
    state::{
        keys::StateKey,
        records::{
            HostRecord,
            KeyRecord,
            ListenerRecord,
            NamespaceRecord,
            SubsystemRecord,
        },
    },
    store::store_defs::{ChangeEvent, Record, Snapshot, WatchMsg, WatchStream},
    tgt::{ignore_exists, ignore_not_found, types::TgtSubsystem},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// First retry delay after an engine apply failure.
const BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Retry delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Well-known discovery subsystem the engine owns; never reconciled.
const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

pub struct Reconciler {
    ctx: Arc<GwContext>,
}

fn decode<T: serde::de::DeserializeOwned>(
    key: &str,
    record: &Record,
) -> Option<T> {
    match serde_json::from_value(record.payload.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            error!("Undecodable record under '{}': {}", key, err);
            None
        }
    }
}

impl Reconciler {
    pub fn new(ctx: Arc<GwContext>) -> Self {
        Self { ctx }
    }

    /// Startup reconciliation: snapshot the map, converge the local engine,
    /// fill the read cache. Runs to completion before the gRPC listener
    /// starts serving.
    pub async fn startup(&self) -> Result<(), SvcError> {
        let snapshot = self.ctx.state.refresh().await?;
        info!(
            "Startup reconciliation against state map epoch {}",
            snapshot.epoch
        );
        self.converge(&snapshot).await
    }

    /// Drain the watch feed forever.
    pub async fn run(self, mut watch: WatchStream) {
        loop {
            match watch.recv().await {
                WatchMsg::Event(event) => {
                    self.ctx.state.apply_event(&event);
                    self.handle(event).await;
                }
                WatchMsg::Lagged => {
                    warn!("Watch feed overflowed, resnapshotting");
                    self.recover().await;
                }
                WatchMsg::Closed => {
                    warn!("Watch feed closed, reconciler stopping");
                    return;
                }
            }
        }
    }

    /// Resnapshot-and-converge until it succeeds.
    async fn recover(&self) {
        let mut delay = BACKOFF_BASE;
        loop {
            let result = match self.ctx.state.refresh().await {
                Ok(snapshot) => self.converge(&snapshot).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => {
                    self.ctx.health.set_healthy();
                    return;
                }
                Err(err) => {
                    self.ctx.health.set_degraded();
                    error!("Recovery failed, retrying in {:?}: {}", delay, err);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Apply one change, retrying with backoff. Applications must stay in
    /// watch-receive order, so this blocks the feed until the change lands.
    async fn handle(&self, event: ChangeEvent) {
        if event.record.as_ref().map(|r| r.writer.as_str())
            == Some(self.ctx.gw_name())
            && !self.ctx.pending.clear(&event.key)
        {
            // authored here and its local effect is already applied
            return;
        }
        let mut delay = BACKOFF_BASE;
        loop {
            match self.apply(&event).await {
                Ok(()) => {
                    self.ctx.health.set_healthy();
                    return;
                }
                Err(err) => {
                    self.ctx.health.set_degraded();
                    warn!(
                        "Could not apply '{}', retrying in {:?}: {}",
                        event.key, delay, err
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), SvcError> {
        let Ok(key) = event.key.parse::<StateKey>() else {
            debug!("Ignoring unknown state map key '{}'", event.key);
            return Ok(());
        };
        let tgt = &self.ctx.tgt;
        match (&key, &event.record) {
            (StateKey::Subsystem { nqn }, Some(record)) => {
                let Some(sub) = decode::<SubsystemRecord>(&event.key, record)
                else {
                    return Ok(());
                };
                let _engine = tgt.lock().await;
                ignore_exists(
                    tgt.create_subsystem(
                        nqn,
                        &sub.serial,
                        sub.max_namespaces,
                        sub.allow_any_host,
                    )
                    .await,
                )?;
                tgt.allow_any_host(nqn, sub.allow_any_host).await?;
            }
            (StateKey::Subsystem { nqn }, None) => {
                let _engine = tgt.lock().await;
                ignore_not_found(tgt.delete_subsystem(nqn).await)?;
            }
            (StateKey::Namespace { nqn, .. }, Some(record)) => {
                let Some(ns) = decode::<NamespaceRecord>(&event.key, record)
                else {
                    return Ok(());
                };
                let _engine = tgt.lock().await;
                self.apply_namespace(nqn, &ns).await?;
            }
            (StateKey::Namespace { nqn, nsid }, None) => {
                let _engine = tgt.lock().await;
                // the key does not name the backing bdev, the engine does
                let bdev = self.engine_subsystem(nqn).await?.and_then(|sub| {
                    sub.namespaces
                        .into_iter()
                        .find(|n| n.nsid == *nsid)
                        .map(|n| n.bdev_name)
                });
                ignore_not_found(tgt.remove_namespace(nqn, *nsid).await)?;
                if let Some(bdev) = bdev.filter(|b| !b.is_empty()) {
                    ignore_not_found(tgt.bdev_rbd_delete(&bdev).await)?;
                }
            }
            (StateKey::Listener { gateway, nqn, .. }, Some(record)) => {
                if gateway != self.ctx.gw_name() {
                    return Ok(());
                }
                let Some(listener) =
                    decode::<ListenerRecord>(&event.key, record)
                else {
                    return Ok(());
                };
                let _engine = tgt.lock().await;
                let address = listener_address(&listener);
                ignore_exists(
                    tgt.add_listener(nqn, address.clone(), listener.secure)
                        .await,
                )?;
                AnaMachine::new(&self.ctx)
                    .apply_listener(nqn, address)
                    .await?;
            }
            (
                StateKey::Listener {
                    gateway,
                    nqn,
                    adrfam,
                    traddr,
                    trsvcid,
                },
                None,
            ) => {
                if gateway != self.ctx.gw_name() {
                    return Ok(());
                }
                let _engine = tgt.lock().await;
                ignore_not_found(
                    tgt.remove_listener(
                        nqn,
                        crate::tgt::types::ListenAddress {
                            trtype: "TCP".to_string(),
                            adrfam: adrfam.tgt_name().to_string(),
                            traddr: traddr.clone(),
                            trsvcid: trsvcid.to_string(),
                        },
                    )
                    .await,
                )?;
            }
            (StateKey::Host { nqn, host_nqn }, Some(record)) => {
                let Some(host) = decode::<HostRecord>(&event.key, record)
                else {
                    return Ok(());
                };
                let _engine = tgt.lock().await;
                if host.is_wildcard() {
                    tgt.allow_any_host(nqn, true).await?;
                } else {
                    self.apply_host(nqn, host_nqn).await?;
                }
            }
            (StateKey::Host { nqn, host_nqn }, None) => {
                let _engine = tgt.lock().await;
                if host_nqn == "*" {
                    tgt.allow_any_host(nqn, false).await?;
                } else {
                    ignore_not_found(tgt.remove_host(nqn, host_nqn).await)?;
                }
            }
            (StateKey::Key { .. }, Some(record)) => {
                let Some(key_rec) = decode::<KeyRecord>(&event.key, record)
                else {
                    return Ok(());
                };
                self.install_key(&key_rec).await?;
            }
            (
                StateKey::Key {
                    nqn,
                    host_nqn,
                    kind,
                },
                None,
            ) => {
                if let Err(err) = self
                    .ctx
                    .keyring
                    .remove(&self.ctx.tgt, nqn, host_nqn, *kind)
                    .await
                {
                    warn!("Key removal for {} failed: {}", host_nqn, err);
                }
            }
            // informational records, nothing to project into the engine
            (StateKey::Gateway { .. }, _) | (StateKey::AnaGroup { .. }, _) => {}
        }
        Ok(())
    }

    /// Make one namespace of the map exist in the engine with the declared
    /// size, group and visibility. Caller holds the engine lock.
    async fn apply_namespace(
        &self,
        nqn: &str,
        ns: &NamespaceRecord,
    ) -> Result<(), SvcError> {
        let tgt = &self.ctx.tgt;
        let bdev = bdev_name(&ns.uuid);
        ignore_exists(
            tgt.bdev_rbd_create(
                &bdev,
                &ns.pool,
                &ns.image,
                ns.block_size,
                Some(&ns.uuid),
            )
            .await,
        )?;
        if ns.size > 0 {
            tgt.bdev_rbd_resize(&bdev, (ns.size + (1 << 20) - 1) >> 20)
                .await?;
        }
        ignore_exists(
            tgt.add_namespace(
                nqn,
                &bdev,
                Some(ns.nsid),
                Some(&ns.uuid),
                ns.anagrpid,
                ns.auto_visible,
            )
            .await,
        )?;
        tgt.set_ns_ana_group(nqn, ns.nsid, ns.anagrpid).await?;

        if !ns.auto_visible {
            // diff the visibility set against what the engine reports
            let engine_hosts = self
                .engine_subsystem(nqn)
                .await?
                .and_then(|sub| {
                    sub.namespaces
                        .into_iter()
                        .find(|n| n.nsid == ns.nsid)
                        .map(|n| n.hosts)
                })
                .unwrap_or_default();
            for host in &ns.visible_hosts {
                if !engine_hosts.iter().any(|h| &h.nqn == host) {
                    ignore_exists(
                        tgt.ns_add_host(nqn, ns.nsid, host).await,
                    )?;
                }
            }
            for host in engine_hosts {
                if !ns.visible_hosts.contains(&host.nqn) {
                    ignore_not_found(
                        tgt.ns_remove_host(nqn, ns.nsid, &host.nqn).await,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Project one explicit host entry, keys included. Caller holds the
    /// engine lock.
    async fn apply_host(
        &self,
        nqn: &str,
        host_nqn: &str,
    ) -> Result<(), SvcError> {
        let mut psk = None;
        let mut dhchap = None;
        let mut dhchap_ctrlr = None;
        let keys: Vec<crate::state::map::Versioned<KeyRecord>> = self
            .ctx
            .state
            .list(&crate::state::keys::host_keys_prefix(nqn, host_nqn))
            .await?;
        for key in keys {
            let name = self.install_key(&key.value).await?;
            match key.value.kind {
                crate::state::records::KeyKind::Psk => psk = Some(name),
                crate::state::records::KeyKind::Dhchap => dhchap = Some(name),
                crate::state::records::KeyKind::DhchapCtrlr => {
                    dhchap_ctrlr = Some(name)
                }
            }
        }
        ignore_exists(
            self.ctx
                .tgt
                .add_host(
                    nqn,
                    host_nqn,
                    psk.as_deref(),
                    dhchap.as_deref(),
                    dhchap_ctrlr.as_deref(),
                )
                .await,
        )?;
        Ok(())
    }

    /// Open a replicated key and register it with the local engine keyring.
    async fn install_key(&self, record: &KeyRecord) -> Result<String, SvcError> {
        let secret =
            self.ctx.keyring.open(record).map_err(|e| SvcError::Keyring {
                nqn: record.nqn.clone(),
                details: e.to_string(),
            })?;
        self.ctx
            .keyring
            .install(
                &self.ctx.tgt,
                &record.nqn,
                &record.host_nqn,
                record.kind,
                &secret,
            )
            .await
            .map_err(|e| SvcError::Keyring {
                nqn: record.nqn.clone(),
                details: e.to_string(),
            })
    }

    async fn engine_subsystem(
        &self,
        nqn: &str,
    ) -> Result<Option<TgtSubsystem>, SvcError> {
        Ok(self
            .ctx
            .tgt
            .get_subsystems()
            .await?
            .into_iter()
            .find(|s| s.nqn == nqn))
    }

    /// Full convergence of the local engine onto a state map snapshot:
    /// everything declared exists, everything undeclared goes away.
    pub async fn converge(&self, snapshot: &Snapshot) -> Result<(), SvcError> {
        let mut subsystems: BTreeMap<String, SubsystemRecord> = BTreeMap::new();
        let mut namespaces: BTreeMap<String, Vec<NamespaceRecord>> =
            BTreeMap::new();
        let mut listeners: BTreeMap<String, Vec<ListenerRecord>> =
            BTreeMap::new();
        let mut hosts: BTreeMap<String, Vec<HostRecord>> = BTreeMap::new();

        for (key, record) in &snapshot.entries {
            match key.parse::<StateKey>() {
                Ok(StateKey::Subsystem { nqn }) => {
                    if let Some(sub) = decode::<SubsystemRecord>(key, record) {
                        subsystems.insert(nqn, sub);
                    }
                }
                Ok(StateKey::Namespace { nqn, .. }) => {
                    if let Some(ns) = decode::<NamespaceRecord>(key, record) {
                        namespaces.entry(nqn).or_default().push(ns);
                    }
                }
                Ok(StateKey::Listener { nqn, gateway, .. })
                    if gateway == self.ctx.gw_name() =>
                {
                    if let Some(l) = decode::<ListenerRecord>(key, record) {
                        listeners.entry(nqn).or_default().push(l);
                    }
                }
                Ok(StateKey::Host { nqn, .. }) => {
                    if let Some(h) = decode::<HostRecord>(key, record) {
                        hosts.entry(nqn).or_default().push(h);
                    }
                }
                _ => {}
            }
        }

        let _engine = self.ctx.tgt.lock().await;
        let actual = self.ctx.tgt.get_subsystems().await?;

        // drop engine subsystems the map does not declare
        for sub in &actual {
            if sub.nqn == DISCOVERY_NQN {
                continue;
            }
            if !subsystems.contains_key(&sub.nqn) {
                info!("Removing undeclared subsystem {} from engine", sub.nqn);
                ignore_not_found(
                    self.ctx.tgt.delete_subsystem(&sub.nqn).await,
                )?;
                for ns in &sub.namespaces {
                    if !ns.bdev_name.is_empty() {
                        ignore_not_found(
                            self.ctx.tgt.bdev_rbd_delete(&ns.bdev_name).await,
                        )?;
                    }
                }
            }
        }

        for (nqn, sub) in &subsystems {
            let engine_sub = actual.iter().find(|s| &s.nqn == nqn);
            ignore_exists(
                self.ctx
                    .tgt
                    .create_subsystem(
                        nqn,
                        &sub.serial,
                        sub.max_namespaces,
                        sub.allow_any_host,
                    )
                    .await,
            )?;
            self.ctx.tgt.allow_any_host(nqn, sub.allow_any_host).await?;

            let declared_ns = namespaces.remove(nqn).unwrap_or_default();
            if let Some(engine_sub) = engine_sub {
                for engine_ns in &engine_sub.namespaces {
                    if !declared_ns.iter().any(|n| n.nsid == engine_ns.nsid) {
                        ignore_not_found(
                            self.ctx
                                .tgt
                                .remove_namespace(nqn, engine_ns.nsid)
                                .await,
                        )?;
                        if !engine_ns.bdev_name.is_empty() {
                            ignore_not_found(
                                self.ctx
                                    .tgt
                                    .bdev_rbd_delete(&engine_ns.bdev_name)
                                    .await,
                            )?;
                        }
                    }
                }
            }
            for ns in &declared_ns {
                self.apply_namespace(nqn, ns).await?;
            }

            let declared_lst = listeners.remove(nqn).unwrap_or_default();
            if let Some(engine_sub) = engine_sub {
                // local engine listeners the map no longer declares
                for la in &engine_sub.listen_addresses {
                    let declared = declared_lst.iter().any(|l| {
                        l.traddr == la.traddr
                            && l.trsvcid.to_string() == la.trsvcid
                            && l.adrfam
                                .tgt_name()
                                .eq_ignore_ascii_case(&la.adrfam)
                    });
                    if !declared {
                        ignore_not_found(
                            self.ctx
                                .tgt
                                .remove_listener(nqn, la.clone())
                                .await,
                        )?;
                    }
                }
            }
            for listener in declared_lst {
                let address = listener_address(&listener);
                ignore_exists(
                    self.ctx
                        .tgt
                        .add_listener(nqn, address.clone(), listener.secure)
                        .await,
                )?;
                AnaMachine::new(&self.ctx)
                    .apply_listener(nqn, address)
                    .await?;
            }

            let declared_hosts = hosts.remove(nqn).unwrap_or_default();
            if let Some(engine_sub) = engine_sub {
                for engine_host in &engine_sub.hosts {
                    if !declared_hosts
                        .iter()
                        .any(|h| h.host_nqn == engine_host.nqn)
                    {
                        ignore_not_found(
                            self.ctx
                                .tgt
                                .remove_host(nqn, &engine_host.nqn)
                                .await,
                        )?;
                    }
                }
            }
            for host in declared_hosts {
                if host.is_wildcard() {
                    self.ctx.tgt.allow_any_host(nqn, true).await?;
                } else {
                    self.apply_host(nqn, &host.host_nqn).await?;
                }
            }
        }
        Ok(())
    }
}
