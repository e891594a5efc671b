//! Subsystem operations.

use crate::{
    context::GwContext,
    error::SvcError,
    service::{engine_apply, validate_nqn, with_cas_retry},
    state::{
        keys::{
            hosts_prefix,
            keys_prefix,
            listeners_prefix,
            namespaces_prefix,
            subsystems_prefix,
            StateKey,
        },
        map::{StateMap, Versioned},
        records::{
            HostRecord,
            KeyRecord,
            ListenerRecord,
            NamespaceRecord,
            SubsystemRecord,
        },
    },
    tgt::{ignore_exists, ignore_not_found},
};
use rand::Rng;
use tracing::{debug, info, warn};

/// Default namespace limit of a subsystem when the caller leaves it open.
pub const DEFAULT_MAX_NAMESPACES: u32 = 256;

/// Validated inputs of `subsystem_add`.
#[derive(Debug, Clone)]
pub struct SubsystemAddArgs {
    pub nqn: String,
    pub serial: Option<String>,
    pub max_namespaces: Option<u32>,
    pub no_group_append: bool,
}

/// Everything that hangs off one subsystem in the state map.
#[derive(Debug, Clone)]
pub struct SubsystemView {
    pub subsystem: SubsystemRecord,
    pub namespaces: Vec<NamespaceRecord>,
    pub listeners: Vec<ListenerRecord>,
    pub hosts: Vec<HostRecord>,
}

fn random_serial() -> String {
    format!("SPDK{:012}", rand::thread_rng().gen_range(0 .. 1_000_000_000_000u64))
}

/// The gateway group name is appended to the NQN unless the caller opted
/// out, so several groups can share an NQN namespace without clashing.
fn effective_nqn(ctx: &GwContext, nqn: &str, no_group_append: bool) -> String {
    let group = &ctx.config.gateway.group;
    if no_group_append || group.is_empty() {
        nqn.to_string()
    } else {
        format!("{}.{}", nqn, group)
    }
}

/// Create a subsystem: record first (the change is cluster-wide), local
/// engine second. Peers pick it up from the watch feed.
pub async fn add(
    ctx: &GwContext,
    args: SubsystemAddArgs,
) -> Result<SubsystemRecord, SvcError> {
    validate_nqn(&args.nqn)?;
    let nqn = effective_nqn(ctx, &args.nqn, args.no_group_append);
    validate_nqn(&nqn)?;
    if args.max_namespaces == Some(0) {
        return Err(SvcError::InvalidArguments {
            details: "max-namespaces must be at least 1".to_string(),
        });
    }

    let _lock = ctx.locks.lock(&nqn).await;
    let key = StateKey::Subsystem { nqn: nqn.clone() };

    let record = with_cas_retry(|| async {
        if ctx
            .state
            .get::<SubsystemRecord>(&key)
            .await?
            .is_some()
        {
            return Err(SvcError::SubsystemExists { nqn: nqn.clone() });
        }
        let record = SubsystemRecord {
            nqn: nqn.clone(),
            serial: args.serial.clone().unwrap_or_else(random_serial),
            max_namespaces: args
                .max_namespaces
                .unwrap_or(DEFAULT_MAX_NAMESPACES),
            allow_any_host: false,
            created_without_group_append: args.no_group_append,
        };
        ctx.state.create(&key, &record).await?;
        Ok(record)
    })
    .await?;

    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        ignore_exists(
            ctx.tgt
                .create_subsystem(
                    &record.nqn,
                    &record.serial,
                    record.max_namespaces,
                    record.allow_any_host,
                )
                .await,
        )
    })
    .await?;

    info!("Created subsystem {}", record.nqn);
    Ok(record)
}

/// Read every record belonging to a subsystem, with versions.
pub(crate) struct SubsystemContents {
    pub subsystem: Versioned<SubsystemRecord>,
    pub namespaces: Vec<Versioned<NamespaceRecord>>,
    pub listeners: Vec<Versioned<ListenerRecord>>,
    pub hosts: Vec<Versioned<HostRecord>>,
    pub keys: Vec<Versioned<KeyRecord>>,
}

pub(crate) async fn contents(
    state: &StateMap,
    nqn: &str,
) -> Result<SubsystemContents, SvcError> {
    let subsystem = state
        .get::<SubsystemRecord>(&StateKey::Subsystem {
            nqn: nqn.to_string(),
        })
        .await?
        .ok_or_else(|| SvcError::SubsystemNotFound {
            nqn: nqn.to_string(),
        })?;
    Ok(SubsystemContents {
        subsystem,
        namespaces: state.list(&namespaces_prefix(nqn)).await?,
        listeners: state.list(&listeners_prefix(nqn)).await?,
        hosts: state.list(&hosts_prefix(nqn)).await?,
        keys: state.list(&keys_prefix(nqn)).await?,
    })
}

/// Delete a subsystem. Without `force` the subsystem must hold no namespaces
/// and no explicit hosts (a sole `"*"` entry counts as empty); with `force`
/// all dependents disappear in one atomic state map write under the advisory
/// lock.
pub async fn del(
    ctx: &GwContext,
    nqn: &str,
    force: bool,
) -> Result<(), SvcError> {
    validate_nqn(nqn)?;
    let _lock = ctx.locks.lock(nqn).await;
    let key = StateKey::Subsystem {
        nqn: nqn.to_string(),
    };

    let removed = with_cas_retry(|| async {
        let contents = contents(&ctx.state, nqn).await?;
        let explicit_hosts = contents
            .hosts
            .iter()
            .filter(|h| !h.value.is_wildcard())
            .count();
        if !force && (!contents.namespaces.is_empty() || explicit_hosts > 0) {
            return Err(SvcError::SubsystemNotEmpty {
                nqn: nqn.to_string(),
                namespaces: contents.namespaces.len(),
                hosts: explicit_hosts,
            });
        }

        // cross-key atomicity wants the advisory lock held around the txn;
        // dependents go first so peers can still resolve them against a
        // live subsystem when draining the change feed
        let guard = ctx.state.lock().await?;
        let mut ops = Vec::new();
        for ns in &contents.namespaces {
            ops.push(StateMap::delete_op(
                &StateKey::Namespace {
                    nqn: nqn.to_string(),
                    nsid: ns.value.nsid,
                },
                Some(ns.version),
            ));
        }
        for listener in &contents.listeners {
            ops.push(StateMap::delete_op(
                &StateKey::Listener {
                    nqn: nqn.to_string(),
                    gateway: listener.value.gateway.clone(),
                    adrfam: listener.value.adrfam,
                    traddr: listener.value.traddr.clone(),
                    trsvcid: listener.value.trsvcid,
                },
                Some(listener.version),
            ));
        }
        for host in &contents.hosts {
            ops.push(StateMap::delete_op(
                &StateKey::Host {
                    nqn: nqn.to_string(),
                    host_nqn: host.value.host_nqn.clone(),
                },
                Some(host.version),
            ));
        }
        for key_rec in &contents.keys {
            ops.push(StateMap::delete_op(
                &StateKey::Key {
                    nqn: nqn.to_string(),
                    host_nqn: key_rec.value.host_nqn.clone(),
                    kind: key_rec.value.kind,
                },
                Some(key_rec.version),
            ));
        }
        ops.push(StateMap::delete_op(
            &key,
            Some(contents.subsystem.version),
        ));
        let result = ctx.state.txn(ops).await;
        if let Err(err) = guard.unlock().await {
            warn!("Advisory unlock failed: {}", err);
        }
        result?;
        Ok(contents)
    })
    .await?;

    // local engine teardown; peers react to the delete events
    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        ignore_not_found(ctx.tgt.delete_subsystem(nqn).await)?;
        for ns in &removed.namespaces {
            ignore_not_found(
                ctx.tgt
                    .bdev_rbd_delete(&crate::service::namespace::bdev_name(
                        &ns.value.uuid,
                    ))
                    .await,
            )?;
        }
        Ok(())
    })
    .await?;

    for key_rec in &removed.keys {
        if let Err(err) = ctx
            .keyring
            .remove(
                &ctx.tgt,
                nqn,
                &key_rec.value.host_nqn,
                key_rec.value.kind,
            )
            .await
        {
            warn!("Keyring cleanup on {} failed: {}", nqn, err);
        }
    }

    info!(
        "Deleted subsystem {} ({} namespaces, {} hosts){}",
        nqn,
        removed.namespaces.len(),
        removed.hosts.len(),
        if force { " [forced]" } else { "" }
    );
    Ok(())
}

/// Cluster-wide view of every subsystem, served from the state map so any
/// gateway answers with the same structure.
pub async fn list(ctx: &GwContext) -> Result<Vec<SubsystemView>, SvcError> {
    let subsystems: Vec<Versioned<SubsystemRecord>> =
        ctx.state.list(subsystems_prefix()).await?;
    let mut views = Vec::with_capacity(subsystems.len());
    for sub in subsystems {
        let nqn = sub.value.nqn.clone();
        let contents = match contents(&ctx.state, &nqn).await {
            Ok(contents) => contents,
            // deleted concurrently between the two reads
            Err(SvcError::SubsystemNotFound { .. }) => {
                debug!("Subsystem {} vanished during listing", nqn);
                continue;
            }
            Err(err) => return Err(err),
        };
        views.push(SubsystemView {
            subsystem: contents.subsystem.value,
            namespaces: contents
                .namespaces
                .into_iter()
                .map(|v| v.value)
                .collect(),
            listeners: contents
                .listeners
                .into_iter()
                .map(|v| v.value)
                .collect(),
            hosts: contents.hosts.into_iter().map(|v| v.value).collect(),
        });
    }
    Ok(views)
}
