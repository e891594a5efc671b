//! Host ACL operations, including the key lifecycle that rides along with
//! explicit host entries.

use crate::{
    context::GwContext,
    error::SvcError,
    keyring::{validate_key, KeySecret},
    service::{engine_apply, validate_host_nqn, validate_nqn, with_cas_retry},
    state::{
        keys::{host_keys_prefix, hosts_prefix, StateKey},
        map::{StateMap, Versioned},
        records::{HostRecord, KeyKind, KeyRecord, SubsystemRecord},
    },
    tgt::{ignore_exists, ignore_not_found},
};
use tracing::{info, warn};

/// Validated inputs of `host_add`.
#[derive(Debug)]
pub struct HostAddArgs {
    pub nqn: String,
    pub host_nqn: String,
    pub psk: Option<KeySecret>,
    pub dhchap: Option<KeySecret>,
    pub dhchap_ctrlr: Option<KeySecret>,
}

impl HostAddArgs {
    fn keys(&self) -> Vec<(KeyKind, &KeySecret)> {
        let mut keys = Vec::new();
        if let Some(psk) = &self.psk {
            keys.push((KeyKind::Psk, psk));
        }
        if let Some(dhchap) = &self.dhchap {
            keys.push((KeyKind::Dhchap, dhchap));
        }
        if let Some(ctrlr) = &self.dhchap_ctrlr {
            keys.push((KeyKind::DhchapCtrlr, ctrlr));
        }
        keys
    }
}

fn validate_add(args: &HostAddArgs) -> Result<(), SvcError> {
    validate_nqn(&args.nqn)?;
    validate_host_nqn(&args.host_nqn)?;
    if args.host_nqn == "*" && !args.keys().is_empty() {
        return Err(SvcError::InvalidArguments {
            details: "keys cannot be combined with the '*' wildcard"
                .to_string(),
        });
    }
    if args.dhchap_ctrlr.is_some() && args.dhchap.is_none() {
        return Err(SvcError::InvalidArguments {
            details:
                "a controller DH-CHAP key requires a host DH-CHAP key too"
                    .to_string(),
        });
    }
    for (kind, secret) in args.keys() {
        validate_key(kind, secret)
            .map_err(|details| SvcError::InvalidArguments { details })?;
    }
    Ok(())
}

/// Allow a host (or any host via `"*"`) to connect to a subsystem. Explicit
/// entries and the wildcard are mutually exclusive.
pub async fn add(ctx: &GwContext, args: HostAddArgs) -> Result<(), SvcError> {
    validate_add(&args)?;
    let _lock = ctx.locks.lock(&args.nqn).await;
    let wildcard = args.host_nqn == "*";
    let host_key = StateKey::Host {
        nqn: args.nqn.clone(),
        host_nqn: args.host_nqn.clone(),
    };

    let (host_record, key_records) = with_cas_retry(|| async {
        let sub_key = StateKey::Subsystem {
            nqn: args.nqn.clone(),
        };
        let subsystem = ctx
            .state
            .get::<SubsystemRecord>(&sub_key)
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: args.nqn.clone(),
            })?;
        let hosts: Vec<Versioned<HostRecord>> =
            ctx.state.list(&hosts_prefix(&args.nqn)).await?;

        if hosts.iter().any(|h| h.value.host_nqn == args.host_nqn) {
            return Err(SvcError::HostExists {
                nqn: args.nqn.clone(),
                host_nqn: args.host_nqn.clone(),
            });
        }
        if wildcard {
            if hosts.iter().any(|h| !h.value.is_wildcard()) {
                return Err(SvcError::AclModeConflict {
                    nqn: args.nqn.clone(),
                });
            }
        } else if subsystem.value.allow_any_host
            || hosts.iter().any(|h| h.value.is_wildcard())
        {
            return Err(SvcError::AclModeConflict {
                nqn: args.nqn.clone(),
            });
        }

        let host_record = HostRecord {
            nqn: args.nqn.clone(),
            host_nqn: args.host_nqn.clone(),
            use_psk: args.psk.is_some(),
            use_dhchap: args.dhchap.is_some(),
        };
        let mut key_records = Vec::new();
        let mut ops =
            vec![StateMap::put_op(&host_key, 0, &host_record)
                .map_err(SvcError::from)?];
        for (kind, secret) in args.keys() {
            let record = ctx
                .keyring
                .seal(&args.nqn, &args.host_nqn, kind, secret)
                .map_err(|e| SvcError::Keyring {
                    nqn: args.nqn.clone(),
                    details: e.to_string(),
                })?;
            ops.push(
                StateMap::put_op(
                    &StateKey::Key {
                        nqn: args.nqn.clone(),
                        host_nqn: args.host_nqn.clone(),
                        kind,
                    },
                    0,
                    &record,
                )
                .map_err(SvcError::from)?,
            );
            key_records.push(record);
        }
        if wildcard {
            let mut sub = subsystem.value.clone();
            sub.allow_any_host = true;
            ops.push(
                StateMap::put_op(&sub_key, subsystem.version, &sub)
                    .map_err(SvcError::from)?,
            );
        }
        ctx.state.txn(ops).await?;
        Ok((host_record, key_records))
    })
    .await?;

    engine_apply(ctx, &host_key, || async {
        let _engine = ctx.tgt.lock().await;
        if wildcard {
            ctx.tgt.allow_any_host(&args.nqn, true).await.map(|_| ())
        } else {
            let mut names: [Option<String>; 3] = Default::default();
            for record in &key_records {
                let secret = match ctx.keyring.open(record) {
                    Ok(secret) => secret,
                    Err(err) => {
                        // a record this gateway just sealed must open
                        warn!("Sealed key failed to open: {}", err);
                        continue;
                    }
                };
                match ctx
                    .keyring
                    .install(
                        &ctx.tgt,
                        &args.nqn,
                        &args.host_nqn,
                        record.kind,
                        &secret,
                    )
                    .await
                {
                    Ok(name) => match record.kind {
                        KeyKind::Psk => names[0] = Some(name),
                        KeyKind::Dhchap => names[1] = Some(name),
                        KeyKind::DhchapCtrlr => names[2] = Some(name),
                    },
                    Err(crate::keyring::KeyringError::EngineKeyring {
                        source,
                    }) => return Err(source),
                    Err(err) => {
                        warn!("Key install failed: {}", err);
                    }
                }
            }
            ignore_exists(
                ctx.tgt
                    .add_host(
                        &args.nqn,
                        &args.host_nqn,
                        names[0].as_deref(),
                        names[1].as_deref(),
                        names[2].as_deref(),
                    )
                    .await,
            )
        }
    })
    .await?;

    info!(
        "Allowed host {} on subsystem {}{}",
        args.host_nqn,
        args.nqn,
        match (host_record.use_psk, host_record.use_dhchap) {
            (true, true) => " (psk, dhchap)",
            (true, false) => " (psk)",
            (false, true) => " (dhchap)",
            (false, false) => "",
        }
    );
    Ok(())
}

/// Remove a host entry; its keys disappear from the state map, the engine
/// keyring and the disk. Removing an absent host is a no-op.
pub async fn del(
    ctx: &GwContext,
    nqn: &str,
    host_nqn: &str,
) -> Result<(), SvcError> {
    validate_nqn(nqn)?;
    validate_host_nqn(host_nqn)?;
    let _lock = ctx.locks.lock(nqn).await;
    let wildcard = host_nqn == "*";
    let host_key = StateKey::Host {
        nqn: nqn.to_string(),
        host_nqn: host_nqn.to_string(),
    };

    let removed = with_cas_retry(|| async {
        let sub_key = StateKey::Subsystem {
            nqn: nqn.to_string(),
        };
        let subsystem = ctx
            .state
            .get::<SubsystemRecord>(&sub_key)
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: nqn.to_string(),
            })?;
        let Some(host) = ctx.state.get::<HostRecord>(&host_key).await?
        else {
            return Ok(None);
        };
        let keys: Vec<Versioned<KeyRecord>> = ctx
            .state
            .list(&host_keys_prefix(nqn, host_nqn))
            .await?;

        let mut ops =
            vec![StateMap::delete_op(&host_key, Some(host.version))];
        for key in &keys {
            ops.push(StateMap::delete_op(
                &StateKey::Key {
                    nqn: nqn.to_string(),
                    host_nqn: host_nqn.to_string(),
                    kind: key.value.kind,
                },
                Some(key.version),
            ));
        }
        if wildcard {
            let mut sub = subsystem.value.clone();
            sub.allow_any_host = false;
            ops.push(
                StateMap::put_op(&sub_key, subsystem.version, &sub)
                    .map_err(SvcError::from)?,
            );
        }
        ctx.state.txn(ops).await?;
        Ok(Some(keys))
    })
    .await?;

    let Some(keys) = removed else {
        return Ok(());
    };

    engine_apply(ctx, &host_key, || async {
        let _engine = ctx.tgt.lock().await;
        if wildcard {
            ctx.tgt.allow_any_host(nqn, false).await.map(|_| ())
        } else {
            ignore_not_found(ctx.tgt.remove_host(nqn, host_nqn).await)
        }
    })
    .await?;

    for key in &keys {
        if let Err(err) = ctx
            .keyring
            .remove(&ctx.tgt, nqn, host_nqn, key.value.kind)
            .await
        {
            warn!("Keyring cleanup for host {} failed: {}", host_nqn, err);
        }
    }

    info!("Removed host {} from subsystem {}", host_nqn, nqn);
    Ok(())
}

/// The host ACL of one subsystem.
pub async fn list(
    ctx: &GwContext,
    nqn: &str,
) -> Result<(bool, Vec<HostRecord>), SvcError> {
    validate_nqn(nqn)?;
    let subsystem = ctx
        .state
        .get::<SubsystemRecord>(&StateKey::Subsystem {
            nqn: nqn.to_string(),
        })
        .await?
        .ok_or_else(|| SvcError::SubsystemNotFound {
            nqn: nqn.to_string(),
        })?;
    let hosts: Vec<Versioned<HostRecord>> =
        ctx.state.list(&hosts_prefix(nqn)).await?;
    Ok((
        subsystem.value.allow_any_host,
        hosts
            .into_iter()
            .map(|v| v.value)
            .filter(|h| !h.is_wildcard())
            .collect(),
    ))
}
