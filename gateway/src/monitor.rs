//! Monitor client: registers the gateway with the clustered ANA controller,
//! heartbeats while alive, consumes the assignment stream and deregisters on
//! clean shutdown. A gateway that fails to deregister within the deadline
//! gets its node address blocklisted by the controller to fence stale IO.

use crate::{
    error::SvcError,
    ha::{AnaAssignment, AnaMachine},
    state::records::AnaState,
};
use futures::{select, FutureExt, StreamExt};
use rpc::monitor::{
    monitor_client::MonitorClient as MonitorGrpcClient,
    AnaState as WireAnaState,
    DeregisterRequest,
    HeartbeatRequest,
    RegisterRequest,
    WatchAnaRequest,
};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{error, info, warn};

/// Heartbeat interval towards the controller.
const HB_INTERVAL: Duration = Duration::from_secs(5);
/// How long one registration or heartbeat call may take.
const HB_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline of the clean-shutdown deregistration; beyond it the controller
/// fences this node.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay before the assignment stream is re-established after it breaks.
const WATCH_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct Configuration {
    /// Name of this gateway.
    gateway_name: String,
    /// Gateway group the registration is scoped by.
    group: String,
    /// Address of this node, the thing the controller would blocklist.
    node_addr: String,
    /// Port of the admin server, reported for operator tooling.
    grpc_port: u16,
}

/// Registration component tying one gateway to the controller.
#[derive(Clone)]
pub struct MonitorClient {
    config: Configuration,
    monitor_endpoint: Endpoint,
    /// Receive channel for termination
    rcv_chan: async_channel::Receiver<()>,
    /// Termination channel
    fini_chan: async_channel::Sender<()>,
}

impl MonitorClient {
    pub fn new(
        monitor_addr: &str,
        gateway_name: &str,
        group: &str,
        node_addr: &str,
        grpc_port: u16,
    ) -> Result<Self, SvcError> {
        let endpoint = Endpoint::from_shared(monitor_addr.to_string())
            .map_err(|e| SvcError::MonitorUnavailable {
                details: format!("bad monitor address: {}", e),
            })?
            .connect_timeout(HB_TIMEOUT)
            .timeout(HB_TIMEOUT);
        let (fini_chan, rcv_chan) = async_channel::unbounded::<()>();
        Ok(Self {
            config: Configuration {
                gateway_name: gateway_name.to_string(),
                group: group.to_string(),
                node_addr: node_addr.to_string(),
                grpc_port,
            },
            monitor_endpoint: endpoint,
            rcv_chan,
            fini_chan,
        })
    }

    /// Ask the run loops to terminate and deregister.
    pub fn shutdown(&self) {
        self.fini_chan.close();
    }

    async fn client(&self) -> Result<MonitorGrpcClient<Channel>, SvcError> {
        MonitorGrpcClient::connect(self.monitor_endpoint.clone())
            .await
            .map_err(|e| SvcError::MonitorUnavailable {
                details: e.to_string(),
            })
    }

    /// Register this gateway; returns the load balancing group it was
    /// enrolled under.
    pub async fn register(&self) -> Result<u32, SvcError> {
        let reply = self
            .client()
            .await?
            .register(tonic::Request::new(RegisterRequest {
                gateway_name: self.config.gateway_name.clone(),
                group: self.config.group.clone(),
                node_addr: self.config.node_addr.clone(),
                grpc_port: self.config.grpc_port as u32,
            }))
            .await
            .map_err(|e| SvcError::MonitorUnavailable {
                details: e.to_string(),
            })?;
        let anagrpid = reply.into_inner().anagrpid;
        info!(
            "Registered gateway '{}' with the controller (group {})",
            self.config.gateway_name, anagrpid
        );
        Ok(anagrpid)
    }

    /// Deregister on clean shutdown, bounded by the fencing deadline.
    pub async fn deregister(&self) -> Result<(), SvcError> {
        let call = async {
            self.client()
                .await?
                .deregister(tonic::Request::new(DeregisterRequest {
                    gateway_name: self.config.gateway_name.clone(),
                    group: self.config.group.clone(),
                }))
                .await
                .map_err(|e| SvcError::MonitorUnavailable {
                    details: e.to_string(),
                })?;
            Ok(())
        };
        match tokio::time::timeout(DEREGISTER_TIMEOUT, call).await {
            Ok(result) => {
                if result.is_ok() {
                    info!(
                        "Deregistered '{}' from the controller",
                        self.config.gateway_name
                    );
                }
                result
            }
            Err(_) => {
                warn!(
                    "Deregistration did not finish within {:?}; the \
                     controller will blocklist {} to fence stale IO",
                    DEREGISTER_TIMEOUT, self.config.node_addr
                );
                Err(SvcError::Deadline {})
            }
        }
    }

    async fn heartbeat(&self) -> Result<(), SvcError> {
        self.client()
            .await?
            .heartbeat(tonic::Request::new(HeartbeatRequest {
                gateway_name: self.config.gateway_name.clone(),
                group: self.config.group.clone(),
            }))
            .await
            .map_err(|e| SvcError::MonitorUnavailable {
                details: e.to_string(),
            })?;
        Ok(())
    }

    /// Heartbeat loop; registers first, deregisters when `shutdown` is
    /// called.
    pub async fn run_loop(&self) {
        info!(
            "Heartbeating '{}' towards the controller ...",
            self.config.gateway_name
        );
        let mut rcv_chan = self.rcv_chan.clone();
        loop {
            if let Err(err) = self.heartbeat().await {
                error!("Heartbeat failed: {}", err);
            }
            select! {
                _ = tokio::time::sleep(HB_INTERVAL).fuse() => continue,
                msg = rcv_chan.next().fuse() => {
                    match msg {
                        Some(_) => continue,
                        None => {
                            info!("Terminating the monitor handler");
                            break;
                        }
                    }
                }
            };
        }
        if let Err(err) = self.deregister().await {
            error!("Deregistration failed: {}", err);
        }
    }

    /// Consume the assignment stream and drive the ANA machine, in arrival
    /// order. The stream is re-established with a delay whenever it breaks,
    /// until shutdown.
    pub async fn watch_ana(&self, machine: AnaMachine) {
        loop {
            if self.rcv_chan.is_closed() {
                return;
            }
            let mut stream = match self.open_stream().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("ANA stream unavailable: {}", err);
                    tokio::time::sleep(WATCH_RETRY).await;
                    continue;
                }
            };
            loop {
                let event = match stream.message().await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("ANA stream failed: {}", err);
                        break;
                    }
                };
                let state = match WireAnaState::try_from(event.state) {
                    Ok(WireAnaState::Optimized) => AnaState::Optimized,
                    Ok(WireAnaState::Inaccessible) => AnaState::Inaccessible,
                    Err(_) => {
                        warn!("Unknown ANA state {} ignored", event.state);
                        continue;
                    }
                };
                if let Err(err) = machine
                    .handle(AnaAssignment {
                        grp: event.anagrpid,
                        state,
                    })
                    .await
                {
                    error!("ANA transition failed: {}", err);
                }
            }
            tokio::time::sleep(WATCH_RETRY).await;
        }
    }

    async fn open_stream(
        &self,
    ) -> Result<tonic::Streaming<rpc::monitor::AnaEvent>, SvcError> {
        let reply = self
            .client()
            .await?
            .watch_ana(tonic::Request::new(WatchAnaRequest {
                gateway_name: self.config.gateway_name.clone(),
                group: self.config.group.clone(),
            }))
            .await
            .map_err(|e| SvcError::MonitorUnavailable {
                details: e.to_string(),
            })?;
        Ok(reply.into_inner())
    }
}
