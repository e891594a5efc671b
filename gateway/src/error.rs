//! Service level error type for the gateway. Handler-local validation errors
//! are returned directly; engine and store errors are wrapped so the original
//! code survives up to the gRPC edge where everything is mapped onto the
//! canonical grpc codes.

use crate::store::store_defs::StoreError;
use snafu::Snafu;
use tonic::{Code, Status};

/// Common error type for all gateway service operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum SvcError {
    #[snafu(display("Invalid NQN '{}': {}", nqn, reason))]
    InvalidNqn { nqn: String, reason: String },
    #[snafu(display("Invalid argument: {}", details))]
    InvalidArguments { details: String },
    #[snafu(display("Subsystem '{}' not found", nqn))]
    SubsystemNotFound { nqn: String },
    #[snafu(display("Subsystem '{}' already exists", nqn))]
    SubsystemExists { nqn: String },
    #[snafu(display(
        "Subsystem '{}' is not empty ({} namespaces, {} hosts)",
        nqn,
        namespaces,
        hosts
    ))]
    SubsystemNotEmpty {
        nqn: String,
        namespaces: usize,
        hosts: usize,
    },
    #[snafu(display("Namespace {} in subsystem '{}' not found", nsid, nqn))]
    NamespaceNotFound { nqn: String, nsid: u32 },
    #[snafu(display("Namespace {} in subsystem '{}' already exists", nsid, nqn))]
    NamespaceExists { nqn: String, nsid: u32 },
    #[snafu(display(
        "Subsystem '{}' reached its namespace limit of {}",
        nqn,
        max
    ))]
    NamespaceLimit { nqn: String, max: u32 },
    #[snafu(display(
        "Namespace {} in subsystem '{}' is auto visible, host visibility \
         cannot be managed",
        nsid,
        nqn
    ))]
    NamespaceAutoVisible { nqn: String, nsid: u32 },
    #[snafu(display(
        "Listener {}:{} on subsystem '{}' already exists",
        traddr,
        trsvcid,
        nqn
    ))]
    ListenerExists {
        nqn: String,
        traddr: String,
        trsvcid: u16,
    },
    #[snafu(display(
        "Listener {}:{} on subsystem '{}' not found",
        traddr,
        trsvcid,
        nqn
    ))]
    ListenerNotFound {
        nqn: String,
        traddr: String,
        trsvcid: u16,
    },
    #[snafu(display(
        "Listener belongs to gateway '{}', this gateway is '{}'",
        requested,
        local
    ))]
    WrongGateway { requested: String, local: String },
    #[snafu(display("Host '{}' on subsystem '{}' not found", host_nqn, nqn))]
    HostNotFound { nqn: String, host_nqn: String },
    #[snafu(display("Host '{}' on subsystem '{}' already exists", host_nqn, nqn))]
    HostExists { nqn: String, host_nqn: String },
    #[snafu(display(
        "Explicit host entries and the '*' wildcard are mutually exclusive \
         on subsystem '{}'",
        nqn
    ))]
    AclModeConflict { nqn: String },
    #[snafu(display(
        "Concurrent configuration update on '{}', retry the operation",
        key
    ))]
    Conflict { key: String },
    #[snafu(display("State store failure"))]
    Store { source: StoreError },
    #[snafu(display("Engine call '{}' failed: {}", method, source))]
    Engine {
        method: String,
        source: jsonrpc::error::Error,
    },
    #[snafu(display("Keyring failure for subsystem '{}': {}", nqn, details))]
    Keyring { nqn: String, details: String },
    #[snafu(display("Monitor unavailable: {}", details))]
    MonitorUnavailable { details: String },
    #[snafu(display("Deadline expired"))]
    Deadline {},
    #[snafu(display("Internal error: {}", details))]
    Internal { details: String },
}

impl From<crate::tgt::TgtError> for SvcError {
    fn from(error: crate::tgt::TgtError) -> Self {
        SvcError::Engine {
            method: error.method,
            source: error.source,
        }
    }
}

impl From<StoreError> for SvcError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::VersionConflict { key, .. } => {
                SvcError::Conflict { key }
            }
            other => SvcError::Store { source: other },
        }
    }
}

impl From<SvcError> for Status {
    fn from(error: SvcError) -> Self {
        let msg = error.to_string();
        let code = match &error {
            SvcError::InvalidNqn { .. }
            | SvcError::InvalidArguments { .. }
            | SvcError::WrongGateway { .. } => Code::InvalidArgument,
            SvcError::SubsystemNotFound { .. }
            | SvcError::NamespaceNotFound { .. }
            | SvcError::ListenerNotFound { .. }
            | SvcError::HostNotFound { .. } => Code::NotFound,
            SvcError::SubsystemExists { .. }
            | SvcError::NamespaceExists { .. }
            | SvcError::ListenerExists { .. }
            | SvcError::HostExists { .. } => Code::AlreadyExists,
            SvcError::SubsystemNotEmpty { .. }
            | SvcError::AclModeConflict { .. }
            | SvcError::NamespaceAutoVisible { .. } => Code::FailedPrecondition,
            SvcError::NamespaceLimit { .. } => Code::ResourceExhausted,
            SvcError::Conflict { .. } => Code::Aborted,
            SvcError::Deadline { .. } => Code::DeadlineExceeded,
            SvcError::Store { source } => {
                return match source {
                    StoreError::Unavailable { .. } => {
                        Status::new(Code::Unavailable, msg)
                    }
                    _ => Status::new(Code::Internal, msg),
                };
            }
            SvcError::Engine { source, .. } => {
                // reuse the engine error mapping but keep the wrapped message
                let status = match source {
                    jsonrpc::error::Error::RpcError { code, .. } => {
                        use jsonrpc::error::RpcCode;
                        match code {
                            RpcCode::InvalidParams => Code::InvalidArgument,
                            RpcCode::NotFound => Code::NotFound,
                            RpcCode::AlreadyExists => Code::AlreadyExists,
                            RpcCode::NoSpace => Code::ResourceExhausted,
                            _ => Code::Internal,
                        }
                    }
                    jsonrpc::error::Error::Timeout { .. } => {
                        Code::DeadlineExceeded
                    }
                    jsonrpc::error::Error::ConnectError { .. }
                    | jsonrpc::error::Error::Unreachable { .. } => {
                        Code::Unavailable
                    }
                    _ => Code::Internal,
                };
                return Status::new(status, msg);
            }
            SvcError::MonitorUnavailable { .. } => Code::Unavailable,
            SvcError::Keyring { .. } | SvcError::Internal { .. } => {
                Code::Internal
            }
        };
        Status::new(code, msg)
    }
}

/// Walk an error chain and produce one line with every cause.
pub fn print_error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = format!("{}", err);
    let mut opt_source = err.source();
    while let Some(source) = opt_source {
        msg = format!("{}: {}", msg, source);
        opt_source = source.source();
    }
    msg
}
