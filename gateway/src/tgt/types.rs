//! Wire shapes of the engine RPCs the gateway drives. Parameter structs
//! serialize exactly to the json the engine expects; reply structs are kept
//! tolerant (unknown fields ignored) since the engine adds fields between
//! releases.

use serde::{Deserialize, Serialize};

/// Address triple of a listener as the engine understands it. The engine
/// wants the service id as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenAddress {
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
    pub trsvcid: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSubsystemArgs {
    pub nqn: String,
    pub serial_number: String,
    pub max_namespaces: u32,
    pub ana_reporting: bool,
    pub allow_any_host: bool,
}

#[derive(Debug, Serialize)]
pub struct SubsystemNqnArgs {
    pub nqn: String,
}

#[derive(Debug, Serialize)]
pub struct NamespaceParams {
    pub bdev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub anagrpid: u32,
    pub auto_visible: bool,
}

#[derive(Debug, Serialize)]
pub struct AddNamespaceArgs {
    pub nqn: String,
    pub namespace: NamespaceParams,
}

#[derive(Debug, Serialize)]
pub struct RemoveNamespaceArgs {
    pub nqn: String,
    pub nsid: u32,
}

#[derive(Debug, Serialize)]
pub struct SetNsAnaGroupArgs {
    pub nqn: String,
    pub nsid: u32,
    pub anagrpid: u32,
}

#[derive(Debug, Serialize)]
pub struct NsVisibilityArgs {
    pub nqn: String,
    pub nsid: u32,
    pub host: String,
}

#[derive(Debug, Serialize)]
pub struct AddListenerArgs {
    pub nqn: String,
    pub listen_address: ListenAddress,
    pub secure_channel: bool,
}

#[derive(Debug, Serialize)]
pub struct RemoveListenerArgs {
    pub nqn: String,
    pub listen_address: ListenAddress,
}

#[derive(Debug, Serialize)]
pub struct ListenerAnaStateArgs {
    pub nqn: String,
    pub listen_address: ListenAddress,
    pub ana_state: String,
    pub anagrpid: u32,
}

#[derive(Debug, Serialize)]
pub struct AddHostArgs {
    pub nqn: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhchap_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhchap_ctrlr_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveHostArgs {
    pub nqn: String,
    pub host: String,
}

#[derive(Debug, Serialize)]
pub struct AllowAnyHostArgs {
    pub nqn: String,
    pub allow_any_host: bool,
}

#[derive(Debug, Serialize)]
pub struct BdevRbdCreateArgs {
    pub name: String,
    pub pool_name: String,
    pub rbd_name: String,
    pub block_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BdevNameArgs {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct BdevRbdResizeArgs {
    pub name: String,
    /// New size in MiB, the unit the engine resize call expects.
    pub new_size: u64,
}

#[derive(Debug, Serialize)]
pub struct KeyringAddKeyArgs {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct KeyringKeyNameArgs {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct LogLevelArgs {
    pub level: String,
}

/// One namespace as enumerated by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtNamespace {
    pub nsid: u32,
    #[serde(default)]
    pub bdev_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub anagrpid: u32,
    #[serde(default)]
    pub auto_visible: Option<bool>,
    #[serde(default)]
    pub hosts: Vec<TgtHost>,
}

/// One ACL entry as enumerated by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtHost {
    pub nqn: String,
}

/// One subsystem as enumerated by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtSubsystem {
    pub nqn: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub max_namespaces: u32,
    #[serde(default)]
    pub allow_any_host: bool,
    #[serde(default)]
    pub listen_addresses: Vec<ListenAddress>,
    #[serde(default)]
    pub hosts: Vec<TgtHost>,
    #[serde(default)]
    pub namespaces: Vec<TgtNamespace>,
}

/// One live controller of a subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtController {
    pub cntlid: u16,
    pub hostnqn: String,
    #[serde(default)]
    pub hostid: String,
    #[serde(default)]
    pub num_io_qpairs: u32,
}

/// ANA state of one group on one listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtAnaGroupState {
    pub ana_group: u32,
    pub ana_state: String,
}

/// One listener of a subsystem, with its per group ANA states.
#[derive(Debug, Clone, Deserialize)]
pub struct TgtListener {
    pub address: ListenAddress,
    #[serde(default)]
    pub ana_states: Vec<TgtAnaGroupState>,
}
