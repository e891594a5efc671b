//! Gateway grpc methods implementation. Requests are translated into domain
//! types at this edge; the generated message structs never travel further
//! down.

use crate::{
    context::GwContext,
    error::SvcError,
    grpc::{check_deadline, run_guarded, GrpcClientContext, GrpcResult, Guarded},
    keyring::KeySecret,
    logger,
    service::{
        connection,
        host::{self, HostAddArgs},
        listener::{self, ListenerArgs},
        namespace::{self, NamespaceAddArgs},
        subsystem::{self, SubsystemAddArgs, SubsystemView},
    },
    state::records::{
        AddressFamily,
        HostRecord,
        ListenerRecord,
        NamespaceRecord,
    },
};
use ::function_name::named;
use rpc::gateway::*;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::trace;

/// The admin service of one gateway.
#[derive(Clone)]
pub struct GatewayGrpc {
    ctx: Arc<GwContext>,
}

impl GatewayGrpc {
    pub fn new(ctx: Arc<GwContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl<F, T> Guarded<F, T> for GatewayGrpc
where
    T: Send + 'static,
    F: core::future::Future<Output = Result<T, Status>> + Send + 'static,
{
    async fn guarded(&self, ctx: GrpcClientContext, f: F) -> Result<T, Status> {
        run_guarded(ctx, f).await
    }
}

fn adrfam_of(value: i32) -> Result<AddressFamily, Status> {
    match rpc::gateway::AddressFamily::try_from(value) {
        Ok(rpc::gateway::AddressFamily::Ipv4) => Ok(AddressFamily::Ipv4),
        Ok(rpc::gateway::AddressFamily::Ipv6) => Ok(AddressFamily::Ipv6),
        Err(_) => Err(Status::invalid_argument(format!(
            "unknown address family {}",
            value
        ))),
    }
}

fn adrfam_to(value: AddressFamily) -> i32 {
    match value {
        AddressFamily::Ipv4 => rpc::gateway::AddressFamily::Ipv4 as i32,
        AddressFamily::Ipv6 => rpc::gateway::AddressFamily::Ipv6 as i32,
    }
}

fn ok_status() -> (i32, String) {
    (0, String::new())
}

impl From<NamespaceRecord> for Namespace {
    fn from(ns: NamespaceRecord) -> Self {
        Self {
            subsystem_nqn: ns.nqn,
            nsid: ns.nsid,
            rbd_pool_name: ns.pool,
            rbd_image_name: ns.image,
            size: ns.size,
            block_size: ns.block_size,
            uuid: ns.uuid,
            anagrpid: ns.anagrpid,
            auto_visible: ns.auto_visible,
            hosts: ns.visible_hosts.into_iter().collect(),
        }
    }
}

impl From<ListenerRecord> for Listener {
    fn from(listener: ListenerRecord) -> Self {
        Self {
            subsystem_nqn: listener.nqn,
            gateway_name: listener.gateway,
            transport: listener.transport,
            adrfam: adrfam_to(listener.adrfam),
            traddr: listener.traddr,
            trsvcid: listener.trsvcid as u32,
            secure: listener.secure,
        }
    }
}

impl From<HostRecord> for Host {
    fn from(host: HostRecord) -> Self {
        Self {
            subsystem_nqn: host.nqn,
            host_nqn: host.host_nqn,
            use_psk: host.use_psk,
            use_dhchap: host.use_dhchap,
        }
    }
}

impl From<SubsystemView> for Subsystem {
    fn from(view: SubsystemView) -> Self {
        Self {
            subsystem_nqn: view.subsystem.nqn,
            serial_number: view.subsystem.serial,
            max_namespaces: view.subsystem.max_namespaces,
            allow_any_host: view.subsystem.allow_any_host,
            namespace_count: view.namespaces.len() as u32,
            namespaces: view.namespaces.into_iter().map(|n| n.into()).collect(),
            listeners: view.listeners.into_iter().map(|l| l.into()).collect(),
        }
    }
}

fn trsvcid_of(value: u32) -> Result<u16, Status> {
    u16::try_from(value).map_err(|_| {
        Status::invalid_argument(format!("trsvcid {} out of range", value))
    })
}

fn listener_args_of(
    nqn: String,
    gateway_name: String,
    transport: String,
    adrfam: i32,
    traddr: String,
    trsvcid: u32,
    secure: bool,
) -> Result<ListenerArgs, Status> {
    Ok(ListenerArgs {
        nqn,
        gateway: gateway_name,
        transport,
        adrfam: adrfam_of(adrfam)?,
        traddr,
        trsvcid: trsvcid_of(trsvcid)?,
        secure,
    })
}

#[tonic::async_trait]
impl gateway_server::Gateway for GatewayGrpc {
    #[named]
    async fn subsystem_add(
        &self,
        request: Request<SubsystemAddRequest>,
    ) -> GrpcResult<SubsystemAddReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            let record = subsystem::add(
                &ctx,
                SubsystemAddArgs {
                    nqn: args.subsystem_nqn,
                    serial: args.serial_number,
                    max_namespaces: args.max_namespaces,
                    no_group_append: args.no_group_append,
                },
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(SubsystemAddReply {
                status,
                error_message,
                subsystem_nqn: record.nqn,
                serial_number: record.serial,
            }))
        })
        .await
    }

    #[named]
    async fn subsystem_del(
        &self,
        request: Request<SubsystemDelRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            subsystem::del(&ctx, &args.subsystem_nqn, args.force)
                .await
                .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn get_subsystems(
        &self,
        request: Request<GetSubsystemsRequest>,
    ) -> GrpcResult<SubsystemListReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let views =
                subsystem::list(&ctx).await.map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(SubsystemListReply {
                status,
                error_message,
                subsystems: views.into_iter().map(|v| v.into()).collect(),
            }))
        })
        .await
    }

    #[named]
    async fn namespace_add(
        &self,
        request: Request<NamespaceAddRequest>,
    ) -> GrpcResult<NamespaceAddReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            let record = namespace::add(
                &ctx,
                NamespaceAddArgs {
                    nqn: args.subsystem_nqn,
                    nsid: args.nsid,
                    pool: args.rbd_pool_name,
                    image: args.rbd_image_name,
                    size: args.size,
                    block_size: args.block_size,
                    uuid: args.uuid,
                    anagrpid: args.anagrpid,
                    auto_visible: args.auto_visible,
                },
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(NamespaceAddReply {
                status,
                error_message,
                nsid: record.nsid,
                uuid: record.uuid,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_del(
        &self,
        request: Request<NamespaceDelRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            namespace::del(&ctx, &args.subsystem_nqn, args.nsid)
                .await
                .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_resize(
        &self,
        request: Request<NamespaceResizeRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            namespace::resize(
                &ctx,
                &args.subsystem_nqn,
                args.nsid,
                args.new_size,
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_change_load_balancing_group(
        &self,
        request: Request<NamespaceChangeLbGroupRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            namespace::change_lb_group(
                &ctx,
                &args.subsystem_nqn,
                args.nsid,
                args.anagrpid,
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_add_host(
        &self,
        request: Request<NamespaceHostRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            namespace::set_host_visibility(
                &ctx,
                &args.subsystem_nqn,
                args.nsid,
                &args.host_nqn,
                true,
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_del_host(
        &self,
        request: Request<NamespaceHostRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            namespace::set_host_visibility(
                &ctx,
                &args.subsystem_nqn,
                args.nsid,
                &args.host_nqn,
                false,
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn namespace_list(
        &self,
        request: Request<NamespaceListRequest>,
    ) -> GrpcResult<NamespaceListReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let records =
                namespace::list(&ctx, args.subsystem_nqn.as_deref())
                    .await
                    .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(NamespaceListReply {
                status,
                error_message,
                namespaces: records.into_iter().map(|n| n.into()).collect(),
            }))
        })
        .await
    }

    #[named]
    async fn listener_add(
        &self,
        request: Request<ListenerAddRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            let largs = listener_args_of(
                args.subsystem_nqn,
                args.gateway_name,
                args.transport,
                args.adrfam,
                args.traddr,
                args.trsvcid,
                args.secure,
            )?;
            listener::add(&ctx, largs).await.map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn listener_del(
        &self,
        request: Request<ListenerDelRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            let largs = listener_args_of(
                args.subsystem_nqn,
                args.gateway_name,
                args.transport,
                args.adrfam,
                args.traddr,
                args.trsvcid,
                false,
            )?;
            listener::del(&ctx, largs).await.map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn listener_list(
        &self,
        request: Request<ListenerListRequest>,
    ) -> GrpcResult<ListenerListReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let records = listener::list(&ctx, &args.subsystem_nqn)
                .await
                .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(ListenerListReply {
                status,
                error_message,
                listeners: records.into_iter().map(|l| l.into()).collect(),
            }))
        })
        .await
    }

    #[named]
    async fn host_add(
        &self,
        request: Request<HostAddRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        // host_add arguments carry key material, never log them
        let gctx = GrpcClientContext {
            args: "<redacted>".to_string(),
            id: function_name!().to_string(),
        };
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            host::add(
                &ctx,
                HostAddArgs {
                    nqn: args.subsystem_nqn,
                    host_nqn: args.host_nqn,
                    psk: args.psk.map(KeySecret::new),
                    dhchap: args.dhchap_key.map(KeySecret::new),
                    dhchap_ctrlr: args.dhchap_ctrlr_key.map(KeySecret::new),
                },
            )
            .await
            .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn host_del(
        &self,
        request: Request<HostDelRequest>,
    ) -> GrpcResult<StatusReply> {
        check_deadline(&request)?;
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            trace!("{:?}", args);
            host::del(&ctx, &args.subsystem_nqn, &args.host_nqn)
                .await
                .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn host_list(
        &self,
        request: Request<HostListRequest>,
    ) -> GrpcResult<HostListReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let (allow_any_host, hosts) =
                host::list(&ctx, &args.subsystem_nqn)
                    .await
                    .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(HostListReply {
                status,
                error_message,
                allow_any_host,
                hosts: hosts.into_iter().map(|h| h.into()).collect(),
            }))
        })
        .await
    }

    #[named]
    async fn connection_list(
        &self,
        request: Request<ConnectionListRequest>,
    ) -> GrpcResult<ConnectionListReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let rows = connection::list(&ctx, &args.subsystem_nqn)
                .await
                .map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(ConnectionListReply {
                status,
                error_message,
                connections: rows
                    .into_iter()
                    .map(|row| Connection {
                        host_nqn: row.host_nqn,
                        traddr: row.traddr,
                        trsvcid: row.trsvcid as u32,
                        transport: row.transport,
                        qpairs_count: row.qpairs,
                        controller_id: row.controller_id as u32,
                        connected: row.connected,
                        secure: row.secure,
                        use_psk: row.use_psk,
                        use_dhchap: row.use_dhchap,
                    })
                    .collect(),
            }))
        })
        .await
    }

    #[named]
    async fn gw_get_info(
        &self,
        request: Request<GwInfoRequest>,
    ) -> GrpcResult<GwInfoReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let (status, error_message) = ok_status();
            Ok(Response::new(GwInfoReply {
                status,
                error_message,
                name: ctx.config.gateway.name.clone(),
                group: ctx.config.gateway.group.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                addr: ctx.config.gateway.addr.clone(),
                port: ctx.config.gateway.port as u32,
                ana_optimized_groups: ctx
                    .ana
                    .snapshot()
                    .into_iter()
                    .collect(),
                healthy: ctx.health.is_healthy(),
            }))
        })
        .await
    }

    #[named]
    async fn set_log_level(
        &self,
        request: Request<SetLogLevelRequest>,
    ) -> GrpcResult<StatusReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let level = match LogLevel::try_from(args.level) {
                Ok(LogLevel::Error) => "error",
                Ok(LogLevel::Warning) => "warn",
                // tracing has no notice level, debug is the nearest
                Ok(LogLevel::Notice) | Ok(LogLevel::Debug) => "debug",
                Ok(LogLevel::Info) => "info",
                Err(_) => {
                    return Err(Status::invalid_argument(format!(
                        "unknown log level {}",
                        args.level
                    )))
                }
            };
            logger::set_level(level).map_err(Status::internal)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }

    #[named]
    async fn get_log_level(
        &self,
        request: Request<GetLogLevelRequest>,
    ) -> GrpcResult<LogLevelReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        self.guarded(gctx, async move {
            let level = match logger::current_level().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warning,
                "debug" | "trace" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
            let (status, error_message) = ok_status();
            Ok(Response::new(LogLevelReply {
                status,
                error_message,
                level: level as i32,
            }))
        })
        .await
    }

    #[named]
    async fn set_spdk_log_level(
        &self,
        request: Request<SetLogLevelRequest>,
    ) -> GrpcResult<StatusReply> {
        let gctx = GrpcClientContext::new(&request, function_name!());
        let ctx = self.ctx.clone();
        self.guarded(gctx, async move {
            let args = request.into_inner();
            let level = match LogLevel::try_from(args.level) {
                Ok(LogLevel::Error) => "ERROR",
                Ok(LogLevel::Warning) => "WARNING",
                Ok(LogLevel::Notice) => "NOTICE",
                Ok(LogLevel::Info) => "INFO",
                Ok(LogLevel::Debug) => "DEBUG",
                Err(_) => {
                    return Err(Status::invalid_argument(format!(
                        "unknown log level {}",
                        args.level
                    )))
                }
            };
            let result: Result<(), SvcError> = async {
                ctx.tgt.log_set_level(level).await?;
                ctx.tgt.log_set_print_level(level).await?;
                Ok(())
            }
            .await;
            result.map_err(Status::from)?;
            let (status, error_message) = ok_status();
            Ok(Response::new(StatusReply {
                status,
                error_message,
            }))
        })
        .await
    }
}
