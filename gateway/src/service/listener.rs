//! Listener operations.
//!
//! A listener is owned by exactly one gateway: only the owning gateway
//! realizes it in its local engine, every other gateway just records it.
//! Because the change is gateway-local the engine is updated *before* the
//! state map write; a lost CAS race rolls the engine change back.

use crate::{
    context::GwContext,
    error::SvcError,
    ha::{listener_address, AnaMachine},
    service::{validate_nqn, validate_traddr, with_cas_retry},
    state::{
        keys::{listeners_prefix, StateKey},
        map::Versioned,
        records::{AddressFamily, ListenerRecord, SubsystemRecord},
    },
    tgt::{ignore_exists, ignore_not_found},
};
use tracing::{info, warn};

/// Validated inputs of `listener_add` / `listener_del`.
#[derive(Debug, Clone)]
pub struct ListenerArgs {
    pub nqn: String,
    pub gateway: String,
    pub transport: String,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    pub secure: bool,
}

fn validate(args: &ListenerArgs, local_gw: &str) -> Result<(), SvcError> {
    validate_nqn(&args.nqn)?;
    if !args.transport.eq_ignore_ascii_case("tcp") {
        return Err(SvcError::InvalidArguments {
            details: format!(
                "transport '{}' is not supported, only tcp",
                args.transport
            ),
        });
    }
    validate_traddr(&args.traddr, args.adrfam)?;
    if args.trsvcid == 0 {
        return Err(SvcError::InvalidArguments {
            details: "trsvcid must not be 0".to_string(),
        });
    }
    if args.gateway != local_gw {
        return Err(SvcError::WrongGateway {
            requested: args.gateway.clone(),
            local: local_gw.to_string(),
        });
    }
    Ok(())
}

fn record_of(args: &ListenerArgs) -> ListenerRecord {
    ListenerRecord {
        nqn: args.nqn.clone(),
        gateway: args.gateway.clone(),
        transport: args.transport.to_lowercase(),
        adrfam: args.adrfam,
        traddr: args.traddr.clone(),
        trsvcid: args.trsvcid,
        secure: args.secure,
    }
}

fn key_of(args: &ListenerArgs) -> StateKey {
    StateKey::Listener {
        nqn: args.nqn.clone(),
        gateway: args.gateway.clone(),
        adrfam: args.adrfam,
        traddr: args.traddr.clone(),
        trsvcid: args.trsvcid,
    }
}

/// Create a listener on this gateway.
pub async fn add(ctx: &GwContext, args: ListenerArgs) -> Result<(), SvcError> {
    validate(&args, ctx.gw_name())?;
    let _lock = ctx.locks.lock(&args.nqn).await;
    let record = record_of(&args);
    let key = key_of(&args);
    let address = listener_address(&record);

    with_cas_retry(|| async {
        ctx.state
            .get::<SubsystemRecord>(&StateKey::Subsystem {
                nqn: args.nqn.clone(),
            })
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: args.nqn.clone(),
            })?;
        if ctx.state.get::<ListenerRecord>(&key).await?.is_some() {
            return Err(SvcError::ListenerExists {
                nqn: args.nqn.clone(),
                traddr: args.traddr.clone(),
                trsvcid: args.trsvcid,
            });
        }

        // gateway-local change: engine first, map second
        {
            let _engine = ctx.tgt.lock().await;
            ignore_exists(
                ctx.tgt
                    .add_listener(&args.nqn, address.clone(), args.secure)
                    .await,
            )?;
            AnaMachine::new(ctx)
                .apply_listener(&args.nqn, address.clone())
                .await?;
        }

        match ctx.state.create(&key, &record).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // lost the CAS race: drop the local engine change again
                let _engine = ctx.tgt.lock().await;
                if let Err(rollback) = ignore_not_found(
                    ctx.tgt
                        .remove_listener(&args.nqn, address.clone())
                        .await,
                ) {
                    warn!(
                        "Rollback of listener {}:{} failed: {}",
                        args.traddr, args.trsvcid, rollback
                    );
                }
                Err(err.into())
            }
        }
    })
    .await?;

    info!(
        "Created listener {}:{} for {} on gateway {}",
        args.traddr, args.trsvcid, args.nqn, args.gateway
    );
    Ok(())
}

/// Delete a listener on this gateway. Deleting one that was never realized
/// locally is a no-op.
pub async fn del(ctx: &GwContext, args: ListenerArgs) -> Result<(), SvcError> {
    validate(&args, ctx.gw_name())?;
    let _lock = ctx.locks.lock(&args.nqn).await;
    let key = key_of(&args);
    let address = listener_address(&record_of(&args));

    let existed = with_cas_retry(|| async {
        ctx.state
            .get::<SubsystemRecord>(&StateKey::Subsystem {
                nqn: args.nqn.clone(),
            })
            .await?
            .ok_or_else(|| SvcError::SubsystemNotFound {
                nqn: args.nqn.clone(),
            })?;
        match ctx.state.get::<ListenerRecord>(&key).await? {
            Some(existing) => {
                ctx.state.remove(&key, Some(existing.version)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    })
    .await?;

    {
        let _engine = ctx.tgt.lock().await;
        ignore_not_found(
            ctx.tgt.remove_listener(&args.nqn, address).await,
        )?;
    }

    if existed {
        info!(
            "Deleted listener {}:{} of {} on gateway {}",
            args.traddr, args.trsvcid, args.nqn, args.gateway
        );
    }
    Ok(())
}

/// All listeners of one subsystem, across all gateways.
pub async fn list(
    ctx: &GwContext,
    nqn: &str,
) -> Result<Vec<ListenerRecord>, SvcError> {
    validate_nqn(nqn)?;
    ctx.state
        .get::<SubsystemRecord>(&StateKey::Subsystem {
            nqn: nqn.to_string(),
        })
        .await?
        .ok_or_else(|| SvcError::SubsystemNotFound {
            nqn: nqn.to_string(),
        })?;
    let records: Vec<Versioned<ListenerRecord>> =
        ctx.state.list(&listeners_prefix(nqn)).await?;
    Ok(records.into_iter().map(|v| v.value).collect())
}
