//! Control-plane gateway exposing block images in a shared cluster pool as
//! NVMe-oF targets.
//!
//! The gRPC admin surface projects declarative requests onto (a) the local
//! target engine, reached over a json-rpc unix socket, and (b) the cluster
//! wide state map every gateway of the group shares. Peer gateways follow
//! the state map's change feed; the clustered controller hands out ANA
//! groups and the HA machine keeps the advertised access states in step.

pub mod config;
pub mod context;
pub mod core;
pub mod discovery;
pub mod error;
pub mod grpc;
pub mod ha;
pub mod keyring;
pub mod logger;
pub mod monitor;
pub mod reconciler;
pub mod service;
pub mod state;
pub mod store;
pub mod tgt;
