//! Namespace operations.

use crate::{
    context::GwContext,
    error::SvcError,
    service::{engine_apply, validate_nqn, with_cas_retry},
    state::{
        keys::{namespaces_prefix, StateKey},
        map::Versioned,
        records::{NamespaceRecord, SubsystemRecord},
    },
    tgt::{ignore_exists, ignore_not_found},
};
use byte_unit::Byte;
use tracing::info;

const MIB: u64 = 1024 * 1024;

/// Name of the engine block device backing a namespace; derived from the
/// namespace uuid so every gateway creates the same bdev.
pub fn bdev_name(uuid: &str) -> String {
    format!("bdev_{}", uuid)
}

/// Validated inputs of `namespace_add`.
#[derive(Debug, Clone)]
pub struct NamespaceAddArgs {
    pub nqn: String,
    pub nsid: Option<u32>,
    pub pool: String,
    pub image: String,
    pub size: Option<u64>,
    pub block_size: Option<u32>,
    pub uuid: Option<String>,
    pub anagrpid: Option<u32>,
    pub auto_visible: bool,
}

fn validate_add(args: &NamespaceAddArgs) -> Result<(), SvcError> {
    validate_nqn(&args.nqn)?;
    if args.pool.is_empty() || args.image.is_empty() {
        return Err(SvcError::InvalidArguments {
            details: "pool and image must not be empty".to_string(),
        });
    }
    if let Some(block_size) = args.block_size {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "block size {} is not a power of two",
                    block_size
                ),
            });
        }
    }
    if let Some(uuid) = &args.uuid {
        uuid::Uuid::parse_str(uuid).map_err(|e| SvcError::InvalidArguments {
            details: format!("invalid uuid: {}", e),
        })?;
    }
    if args.anagrpid == Some(0) {
        return Err(SvcError::InvalidArguments {
            details: "load balancing group ids start at 1".to_string(),
        });
    }
    Ok(())
}

/// Lowest free nsid, or a deterministic collision for an explicit one.
fn pick_nsid(
    requested: Option<u32>,
    existing: &[Versioned<NamespaceRecord>],
    max: u32,
    nqn: &str,
) -> Result<u32, SvcError> {
    let taken: std::collections::BTreeSet<u32> =
        existing.iter().map(|ns| ns.value.nsid).collect();
    match requested {
        Some(nsid) => {
            if nsid == 0 || nsid > max {
                return Err(SvcError::InvalidArguments {
                    details: format!(
                        "nsid {} outside the valid range 1..={}",
                        nsid, max
                    ),
                });
            }
            if taken.contains(&nsid) {
                return Err(SvcError::NamespaceExists {
                    nqn: nqn.to_string(),
                    nsid,
                });
            }
            Ok(nsid)
        }
        None => (1 ..= max)
            .find(|nsid| !taken.contains(nsid))
            .ok_or_else(|| SvcError::NamespaceLimit {
                nqn: nqn.to_string(),
                max,
            }),
    }
}

/// Create a namespace backed by an rbd image. The nsid is stable for the
/// lifetime of the namespace and the uuid is identical on every gateway.
pub async fn add(
    ctx: &GwContext,
    args: NamespaceAddArgs,
) -> Result<NamespaceRecord, SvcError> {
    validate_add(&args)?;
    let _lock = ctx.locks.lock(&args.nqn).await;

    let record = with_cas_retry(|| async {
        let subsystem = ctx
            .state
            .get::<SubsystemRecord>(&StateKey::Subsystem {
                nqn: args.nqn.clone(),
            })
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: args.nqn.clone(),
            })?;
        let existing: Vec<Versioned<NamespaceRecord>> =
            ctx.state.list(&namespaces_prefix(&args.nqn)).await?;
        if existing.len() as u32 >= subsystem.value.max_namespaces {
            return Err(SvcError::NamespaceLimit {
                nqn: args.nqn.clone(),
                max: subsystem.value.max_namespaces,
            });
        }
        let nsid = pick_nsid(
            args.nsid,
            &existing,
            subsystem.value.max_namespaces,
            &args.nqn,
        )?;
        let record = NamespaceRecord {
            nqn: args.nqn.clone(),
            nsid,
            pool: args.pool.clone(),
            image: args.image.clone(),
            size: args.size.unwrap_or(0),
            block_size: args.block_size.unwrap_or(512),
            uuid: args
                .uuid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            anagrpid: args.anagrpid.unwrap_or(1),
            auto_visible: args.auto_visible,
            visible_hosts: Default::default(),
        };
        ctx.state
            .create(
                &StateKey::Namespace {
                    nqn: args.nqn.clone(),
                    nsid,
                },
                &record,
            )
            .await?;
        Ok(record)
    })
    .await?;

    let key = StateKey::Namespace {
        nqn: record.nqn.clone(),
        nsid: record.nsid,
    };
    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        let bdev = bdev_name(&record.uuid);
        ignore_exists(
            ctx.tgt
                .bdev_rbd_create(
                    &bdev,
                    &record.pool,
                    &record.image,
                    record.block_size,
                    Some(&record.uuid),
                )
                .await,
        )?;
        ignore_exists(
            ctx.tgt
                .add_namespace(
                    &record.nqn,
                    &bdev,
                    Some(record.nsid),
                    Some(&record.uuid),
                    record.anagrpid,
                    record.auto_visible,
                )
                .await,
        )
    })
    .await?;

    info!(
        "Created namespace {} in {} ({}/{}, {})",
        record.nsid,
        record.nqn,
        record.pool,
        record.image,
        Byte::from_bytes(record.size as u128).get_appropriate_unit(true)
    );
    Ok(record)
}

/// Delete a namespace. Deleting one that is already gone is a no-op; only a
/// missing subsystem is an error.
pub async fn del(ctx: &GwContext, nqn: &str, nsid: u32) -> Result<(), SvcError> {
    validate_nqn(nqn)?;
    let _lock = ctx.locks.lock(nqn).await;
    let key = StateKey::Namespace {
        nqn: nqn.to_string(),
        nsid,
    };

    let removed = with_cas_retry(|| async {
        ctx.state
            .get::<SubsystemRecord>(&StateKey::Subsystem {
                nqn: nqn.to_string(),
            })
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: nqn.to_string(),
            })?;
        let Some(existing) =
            ctx.state.get::<NamespaceRecord>(&key).await?
        else {
            return Ok(None);
        };
        ctx.state.remove(&key, Some(existing.version)).await?;
        Ok(Some(existing.value))
    })
    .await?;

    let Some(record) = removed else {
        return Ok(());
    };

    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        ignore_not_found(ctx.tgt.remove_namespace(nqn, nsid).await)?;
        ignore_not_found(
            ctx.tgt.bdev_rbd_delete(&bdev_name(&record.uuid)).await,
        )
    })
    .await?;

    info!("Deleted namespace {} from {}", nsid, nqn);
    Ok(())
}

/// Grow a namespace. Shrinking is refused and the nsid never changes.
pub async fn resize(
    ctx: &GwContext,
    nqn: &str,
    nsid: u32,
    new_size: u64,
) -> Result<NamespaceRecord, SvcError> {
    validate_nqn(nqn)?;
    if new_size == 0 {
        return Err(SvcError::InvalidArguments {
            details: "new size must not be zero".to_string(),
        });
    }
    let _lock = ctx.locks.lock(nqn).await;
    let key = StateKey::Namespace {
        nqn: nqn.to_string(),
        nsid,
    };

    let record = with_cas_retry(|| async {
        let existing = ctx
            .state
            .get::<NamespaceRecord>(&key)
            .await?
            .ok_or(SvcError::NamespaceNotFound {
                nqn: nqn.to_string(),
                nsid,
            })?;
        if new_size < existing.value.size {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "cannot shrink namespace {} from {} to {} bytes",
                    nsid, existing.value.size, new_size
                ),
            });
        }
        let mut record = existing.value;
        record.size = new_size;
        ctx.state.update(&key, existing.version, &record).await?;
        Ok(record)
    })
    .await?;

    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        ctx.tgt
            .bdev_rbd_resize(
                &bdev_name(&record.uuid),
                (new_size + MIB - 1) / MIB,
            )
            .await
    })
    .await?;

    info!(
        "Resized namespace {} in {} to {}",
        nsid,
        nqn,
        Byte::from_bytes(new_size as u128).get_appropriate_unit(true)
    );
    Ok(record)
}

/// Move a namespace to another load balancing group.
pub async fn change_lb_group(
    ctx: &GwContext,
    nqn: &str,
    nsid: u32,
    anagrpid: u32,
) -> Result<NamespaceRecord, SvcError> {
    validate_nqn(nqn)?;
    if anagrpid == 0 {
        return Err(SvcError::InvalidArguments {
            details: "load balancing group ids start at 1".to_string(),
        });
    }
    let _lock = ctx.locks.lock(nqn).await;
    let key = StateKey::Namespace {
        nqn: nqn.to_string(),
        nsid,
    };

    let record = with_cas_retry(|| async {
        let existing = ctx
            .state
            .get::<NamespaceRecord>(&key)
            .await?
            .ok_or(SvcError::NamespaceNotFound {
                nqn: nqn.to_string(),
                nsid,
            })?;
        let mut record = existing.value;
        record.anagrpid = anagrpid;
        ctx.state.update(&key, existing.version, &record).await?;
        Ok(record)
    })
    .await?;

    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        ctx.tgt.set_ns_ana_group(nqn, nsid, anagrpid).await
    })
    .await?;

    info!(
        "Namespace {} in {} now uses load balancing group {}",
        nsid, nqn, anagrpid
    );
    Ok(record)
}

/// Manage per-host visibility of a namespace created without auto
/// visibility.
pub async fn set_host_visibility(
    ctx: &GwContext,
    nqn: &str,
    nsid: u32,
    host_nqn: &str,
    visible: bool,
) -> Result<(), SvcError> {
    validate_nqn(nqn)?;
    validate_nqn(host_nqn)?;
    let _lock = ctx.locks.lock(nqn).await;
    let key = StateKey::Namespace {
        nqn: nqn.to_string(),
        nsid,
    };

    with_cas_retry(|| async {
        let existing = ctx
            .state
            .get::<NamespaceRecord>(&key)
            .await?
            .ok_or(SvcError::NamespaceNotFound {
                nqn: nqn.to_string(),
                nsid,
            })?;
        if existing.value.auto_visible {
            return Err(SvcError::NamespaceAutoVisible {
                nqn: nqn.to_string(),
                nsid,
            });
        }
        let mut record = existing.value;
        let changed = if visible {
            record.visible_hosts.insert(host_nqn.to_string())
        } else {
            record.visible_hosts.remove(host_nqn)
        };
        if changed {
            ctx.state.update(&key, existing.version, &record).await?;
        }
        Ok(())
    })
    .await?;

    engine_apply(ctx, &key, || async {
        let _engine = ctx.tgt.lock().await;
        if visible {
            ignore_exists(ctx.tgt.ns_add_host(nqn, nsid, host_nqn).await)
        } else {
            ignore_not_found(
                ctx.tgt.ns_remove_host(nqn, nsid, host_nqn).await,
            )
        }
    })
    .await?;
    Ok(())
}

/// All namespaces of one subsystem, or of the whole cluster.
pub async fn list(
    ctx: &GwContext,
    nqn: Option<&str>,
) -> Result<Vec<NamespaceRecord>, SvcError> {
    let prefix = match nqn {
        Some(nqn) => {
            validate_nqn(nqn)?;
            namespaces_prefix(nqn)
        }
        None => "ns/".to_string(),
    };
    let records: Vec<Versioned<NamespaceRecord>> =
        ctx.state.list(&prefix).await?;
    Ok(records.into_iter().map(|v| v.value).collect())
}
