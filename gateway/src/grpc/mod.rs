//! gRPC surface plumbing: result alias, per-request context and the guard
//! that recovers handler panics into `Internal` with a correlation id.

mod gateway_grpc;
mod server;

pub use gateway_grpc::GatewayGrpc;
pub use server::GatewayGrpcServer;

use futures::FutureExt;
use std::{fmt::Debug, panic::AssertUnwindSafe};
use tonic::{Request, Response, Status};
use tracing::{error, warn};

pub type GrpcResult<T> = std::result::Result<Response<T>, Status>;

/// Structure that holds information about the current gRPC method being
/// executed; left behind as a marker while a request is in flight so an
/// abnormally terminated call can be reported on the next one.
#[derive(Debug)]
pub(crate) struct GrpcClientContext {
    /// Method arguments.
    pub args: String,
    /// Method id.
    pub id: String,
}

impl GrpcClientContext {
    #[track_caller]
    pub fn new<T>(req: &Request<T>, fid: &str) -> Self
    where
        T: Debug,
    {
        Self {
            args: format!("{:?}", req.get_ref()),
            id: fid.to_string(),
        }
    }
}

/// Trait to guard gRPC request execution. Handlers run concurrently (the
/// real serialization points are the per-subsystem locks and the engine
/// lock); the guard's job is panic recovery.
#[async_trait::async_trait]
pub(crate) trait Guarded<F, T> {
    async fn guarded(&self, ctx: GrpcClientContext, f: F) -> Result<T, Status>;
}

pub(crate) async fn run_guarded<F, T>(
    ctx: GrpcClientContext,
    f: F,
) -> Result<T, Status>
where
    T: Send + 'static,
    F: core::future::Future<Output = Result<T, Status>> + Send + 'static,
{
    let fut = AssertUnwindSafe(f).catch_unwind();
    match fut.await {
        Ok(result) => result,
        Err(_) => {
            let correlation = uuid::Uuid::new_v4();
            error!(
                "{}: gRPC method panicked (correlation id {}), args: {}",
                ctx.id, correlation, ctx.args
            );
            Err(Status::internal(format!(
                "{}: internal failure, correlation id {}",
                ctx.id, correlation
            )))
        }
    }
}

/// Report a request that carried a deadline which has already expired; the
/// handler is not started at all in that case.
pub(crate) fn check_deadline<T>(req: &Request<T>) -> Result<(), Status> {
    if let Some(metadata) = req.metadata().get("grpc-timeout") {
        if metadata.to_str().map(|v| v == "0S").unwrap_or(false) {
            warn!("Request arrived with an expired deadline");
            return Err(Status::deadline_exceeded("deadline expired"));
        }
    }
    Ok(())
}
