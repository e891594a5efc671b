//! Connection inspection: live controller state from the engine joined with
//! the host ACL from the state map, one row per host including disconnected
//! rows for allowed hosts without a controller.

use crate::{
    context::GwContext,
    error::SvcError,
    service::{subsystem, validate_nqn},
};
use std::collections::BTreeMap;

/// One row of `connection_list`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRow {
    pub host_nqn: String,
    pub traddr: String,
    pub trsvcid: u16,
    pub transport: String,
    pub qpairs: u32,
    pub controller_id: u16,
    pub connected: bool,
    pub secure: bool,
    pub use_psk: bool,
    pub use_dhchap: bool,
}

pub async fn list(
    ctx: &GwContext,
    nqn: &str,
) -> Result<Vec<ConnectionRow>, SvcError> {
    validate_nqn(nqn)?;
    let contents = subsystem::contents(&ctx.state, nqn).await?;

    // the engine snapshot is taken under the engine lock so rows cannot mix
    // two generations of controller state
    let controllers = {
        let _engine = ctx.tgt.lock().await;
        match ctx.tgt.get_controllers(nqn).await {
            Ok(controllers) => controllers,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.into()),
        }
    };

    // the local listener gives the address hosts connect to on this gateway
    let local = contents
        .listeners
        .iter()
        .map(|l| &l.value)
        .find(|l| l.gateway == ctx.gw_name());
    let (traddr, trsvcid, transport, secure_listener) = match local {
        Some(listener) => (
            listener.traddr.clone(),
            listener.trsvcid,
            listener.transport.clone(),
            listener.secure,
        ),
        None => (String::new(), 0, "tcp".to_string(), false),
    };

    let acl: BTreeMap<&str, (bool, bool)> = contents
        .hosts
        .iter()
        .map(|h| {
            (
                h.value.host_nqn.as_str(),
                (h.value.use_psk, h.value.use_dhchap),
            )
        })
        .collect();

    let mut rows = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for controller in &controllers {
        let (use_psk, use_dhchap) = acl
            .get(controller.hostnqn.as_str())
            .copied()
            .unwrap_or((false, false));
        seen.insert(controller.hostnqn.clone());
        rows.push(ConnectionRow {
            host_nqn: controller.hostnqn.clone(),
            traddr: traddr.clone(),
            trsvcid,
            transport: transport.clone(),
            qpairs: controller.num_io_qpairs,
            controller_id: controller.cntlid,
            connected: true,
            secure: secure_listener || use_psk,
            use_psk,
            use_dhchap,
        });
    }

    // allowed hosts that are not connected still get a row
    for (host_nqn, (use_psk, use_dhchap)) in &acl {
        if *host_nqn == "*" || seen.contains(*host_nqn) {
            continue;
        }
        rows.push(ConnectionRow {
            host_nqn: host_nqn.to_string(),
            traddr: traddr.clone(),
            trsvcid,
            transport: transport.clone(),
            qpairs: 0,
            controller_id: 0,
            connected: false,
            secure: false,
            use_psk: *use_psk,
            use_dhchap: *use_dhchap,
        });
    }

    Ok(rows)
}
