//! tonic server wiring, with optional mutual TLS on the admin socket.

use crate::{context::GwContext, grpc::GatewayGrpc};
use rpc::gateway::gateway_server::GatewayServer as GatewayRpcServer;
use std::sync::Arc;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, trace};

pub struct GatewayGrpcServer;

impl GatewayGrpcServer {
    pub async fn run(
        endpoint: std::net::SocketAddr,
        ctx: Arc<GwContext>,
    ) -> Result<(), ()> {
        info!("gRPC server configured at address {}", endpoint);
        let mut builder = Server::builder();

        if ctx.config.gateway.enable_auth {
            let tls = match Self::tls_config(&ctx) {
                Ok(tls) => tls,
                Err(err) => {
                    error!("mTLS setup failed: {}", err);
                    return Err(());
                }
            };
            builder = match builder.tls_config(tls) {
                Ok(builder) => builder,
                Err(err) => {
                    error!("mTLS setup failed: {}", err);
                    return Err(());
                }
            };
        }

        let svc = builder
            .add_service(GatewayRpcServer::new(GatewayGrpc::new(ctx)))
            .serve(endpoint);

        match svc.await {
            Ok(result) => {
                trace!(?result);
                Ok(())
            }
            Err(e) => {
                error!("gRPC server failed with error: {}", e);
                Err(())
            }
        }
    }

    fn tls_config(ctx: &GwContext) -> Result<ServerTlsConfig, String> {
        let mtls = &ctx.config.mtls;
        let cert = std::fs::read(&mtls.server_cert)
            .map_err(|e| format!("server cert {}: {}", mtls.server_cert, e))?;
        let key = std::fs::read(&mtls.server_key)
            .map_err(|e| format!("server key {}: {}", mtls.server_key, e))?;
        let client_ca = std::fs::read(&mtls.client_cert)
            .map_err(|e| format!("client cert {}: {}", mtls.client_cert, e))?;
        Ok(ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(client_ca)))
    }
}
