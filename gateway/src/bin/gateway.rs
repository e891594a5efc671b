//! The gateway daemon: wires the engine client, the state map, the peer
//! reconciler, the monitor client, the discovery responder and the gRPC
//! server together and keeps them alive until shutdown.

use clap::Parser;
use nvmeof_gw::{
    config::GwConfig,
    context::{GwContext, Health, PendingApplies},
    core::lock::SubsystemLocks,
    discovery::DiscoveryResponder,
    grpc::GatewayGrpcServer,
    ha::{AnaAssignment, AnaGroups, AnaMachine},
    keyring::Keyring,
    logger::{self, LogFormat},
    monitor::MonitorClient,
    reconciler::Reconciler,
    state::{keys::StateKey, map::StateMap, records::GatewayRecord},
    store::{etcd::EtcdStore, store_defs::StateStore},
    tgt::{ignore_exists, TgtClient},
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "nvmeof-gw",
    about = "NVMe-oF gateway for a distributed object store",
    version
)]
struct CliArgs {
    /// Path of the INI configuration file.
    #[arg(short = 'c', long, default_value = "/etc/nvmeof-gw/nvmeof-gw.conf")]
    config: String,
    /// Address of the clustered ANA controller; without it the gateway runs
    /// standalone and never advertises optimized paths.
    #[arg(short = 'm', long)]
    monitor_address: Option<String>,
    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
    /// Log format options (default, compact, color, nocolor, nodate).
    #[arg(long, default_value = "default")]
    log_format: LogFormat,
}

/// The backing store is essential; keep trying until it answers.
async fn connect_store(config: &GwConfig) -> Arc<dyn StateStore> {
    let mut output_err = true;
    loop {
        match EtcdStore::new(
            &config.ceph.state_endpoint,
            &config.state_prefix(),
        )
        .await
        {
            Ok(store) => return Arc::new(store),
            Err(err) => {
                if output_err {
                    error!(
                        "Failed to connect to state store on {}: {}. \
                         Retrying...",
                        config.ceph.state_endpoint, err
                    );
                    output_err = false;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn group_secret(config: &GwConfig) -> Vec<u8> {
    match std::fs::read(&config.gateway.encryption_key_file) {
        Ok(secret) => secret,
        Err(err) => {
            warn!(
                "No usable encryption key file at {} ({}); falling back to \
                 the group name, replicated keys are only obfuscated",
                config.gateway.encryption_key_file, err
            );
            format!("nvmeof-gw/{}", config.gateway.group).into_bytes()
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term =
        signal(SignalKind::terminate()).expect("signal handler setup");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Keep the cluster's view of this gateway current.
async fn publish_gateway_record(ctx: &GwContext) {
    let record = GatewayRecord {
        name: ctx.config.gateway.name.clone(),
        group: ctx.config.gateway.group.clone(),
        addr: ctx.config.gateway.addr.clone(),
        grpc_port: ctx.config.gateway.port,
        io_port: ctx.config.gateway.io_port,
        discovery_port: ctx.config.discovery.port,
    };
    let key = StateKey::Gateway {
        name: record.name.clone(),
    };
    let result = match ctx.state.get::<GatewayRecord>(&key).await {
        Ok(Some(existing)) => ctx
            .state
            .update(&key, existing.version, &record)
            .await
            .map(|_| ()),
        Ok(None) => ctx.state.create(&key, &record).await.map(|_| ()),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!("Could not publish the gateway record: {}", err);
    }
}

async fn retire_gateway_record(ctx: &GwContext) {
    let key = StateKey::Gateway {
        name: ctx.config.gateway.name.clone(),
    };
    if let Err(err) = ctx.state.remove(&key, None).await {
        warn!("Could not retire the gateway record: {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    logger::init_ex(&args.log_level, args.log_format);

    let config = match std::path::Path::new(&args.config).exists() {
        true => GwConfig::from_file(&args.config)?,
        false => {
            warn!(
                "Config file {} not found, running on defaults",
                args.config
            );
            GwConfig::default()
        }
    };
    info!(
        "Starting nvmeof-gw {} as gateway '{}' in group '{}'",
        env!("CARGO_PKG_VERSION"),
        config.gateway.name,
        config.gateway.group
    );

    // engine connection plus the one-time transport setup
    let tgt = Arc::new(TgtClient::new(
        &config.spdk.rpc_socket,
        config.spdk.timeout,
        config.spdk.conn_retries,
    ));
    tgt.connect().await?;
    for transport in config.spdk.transports.split(',') {
        let transport = transport.trim();
        if transport.is_empty() {
            continue;
        }
        let extra = match transport.eq_ignore_ascii_case("tcp") {
            true if !config.spdk.transport_tcp_options.is_empty() => Some(
                serde_json::from_str(&config.spdk.transport_tcp_options)
                    .map_err(|e| {
                        format!("bad spdk.transport_tcp_options: {}", e)
                    })?,
            ),
            _ => None,
        };
        ignore_exists(tgt.create_transport(transport, extra).await)?;
    }
    if let Err(err) = tgt.log_set_level(&config.spdk.log_level).await {
        warn!("Could not set the engine log level: {}", err);
    }

    let store = connect_store(&config).await;
    let state = Arc::new(StateMap::new(store, &config.gateway.name));
    let keyring = Arc::new(Keyring::new(
        &config.gateway.keyring_dir,
        &group_secret(&config),
    ));

    let config = Arc::new(config);
    let ctx = Arc::new(GwContext {
        config: config.clone(),
        tgt,
        state: state.clone(),
        locks: Arc::new(SubsystemLocks::default()),
        keyring,
        ana: Arc::new(AnaGroups::default()),
        health: Arc::new(Health::default()),
        pending: Arc::new(PendingApplies::default()),
    });

    publish_gateway_record(&ctx).await;

    // converge the local engine before serving any request
    let reconciler = Reconciler::new(ctx.clone());
    reconciler.startup().await?;
    let watch = ctx.state.watch();
    tokio::spawn(reconciler.run(watch));

    // monitor registration and the ANA feed
    let monitor = match &args.monitor_address {
        Some(addr) => {
            let monitor = MonitorClient::new(
                addr,
                &config.gateway.name,
                &config.gateway.group,
                &config.gateway.addr,
                config.gateway.port,
            )?;
            let machine = AnaMachine::new(&ctx);
            let grp = monitor.register().await?;
            machine
                .handle(AnaAssignment {
                    grp,
                    state: nvmeof_gw::state::records::AnaState::Optimized,
                })
                .await?;
            let hb = monitor.clone();
            let hb_task = tokio::spawn(async move { hb.run_loop().await });
            let watcher = monitor.clone();
            tokio::spawn(async move { watcher.watch_ana(machine).await });
            Some((monitor, hb_task))
        }
        None => {
            warn!("No monitor address given, ANA failover is disabled");
            None
        }
    };

    let responder = DiscoveryResponder::new(
        state,
        &config.discovery.addr,
        config.discovery.port,
    );
    tokio::spawn(async move {
        if let Err(err) = responder.run().await {
            error!("Discovery responder failed: {}", err);
        }
    });

    let endpoint: std::net::SocketAddr = config.grpc_endpoint().parse()?;
    let server_ctx = ctx.clone();
    tokio::select! {
        result = GatewayGrpcServer::run(endpoint, server_ctx) => {
            error!("gRPC server terminated: {:?}", result);
        }
        _ = shutdown_signal() => {
            info!("Shutting down");
        }
    }

    // clean shutdown: deregister within the fencing deadline, retire the
    // gateway record
    if let Some((monitor, hb_task)) = monitor {
        monitor.shutdown();
        if tokio::time::timeout(Duration::from_secs(35), hb_task)
            .await
            .is_err()
        {
            warn!("Monitor deregistration timed out");
        }
    }
    retire_gateway_record(&ctx).await;
    Ok(())
}
