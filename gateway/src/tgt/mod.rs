//! Adapter to the NVMe-oF target engine.
//!
//! All verbs go through one persistent json-rpc connection (the engine is
//! single-threaded for command intake, a pool would gain nothing). Compound
//! mutations and snapshot reads additionally take the engine lock so no other
//! task observes or produces a torn view.

pub mod types;

use crate::state::records::{AddressFamily, AnaState};
use jsonrpc::RpcClient;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use self::types::*;

/// Engine-facing error: the failing method plus the transport error.
#[derive(Debug)]
pub struct TgtError {
    pub method: String,
    pub source: jsonrpc::error::Error,
}

impl std::fmt::Display for TgtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine call '{}' failed: {}", self.method, self.source)
    }
}

impl std::error::Error for TgtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl TgtError {
    fn code(&self) -> Option<jsonrpc::error::RpcCode> {
        match &self.source {
            jsonrpc::error::Error::RpcError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The engine already has the entity; an idempotent add treats this as
    /// success.
    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(jsonrpc::error::RpcCode::AlreadyExists)
    }

    /// The engine does not know the entity; an idempotent remove treats this
    /// as success.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(jsonrpc::error::RpcCode::NotFound)
    }
}

/// Collapse an idempotent add: `AlreadyExists` from the engine is success.
pub fn ignore_exists<T>(res: Result<T>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(err) if err.is_already_exists() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Collapse an idempotent remove: `NotFound` from the engine is success.
pub fn ignore_not_found<T>(res: Result<T>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

pub type Result<T> = std::result::Result<T, TgtError>;

impl AddressFamily {
    /// Text form the engine expects.
    pub fn tgt_name(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }
}

impl AnaState {
    /// Text form the engine expects.
    pub fn tgt_name(&self) -> &'static str {
        match self {
            AnaState::Optimized => "optimized",
            AnaState::Inaccessible => "inaccessible",
        }
    }
}

/// Handle to the local target engine.
pub struct TgtClient {
    rpc: RpcClient,
    engine_lock: Mutex<()>,
}

impl TgtClient {
    pub fn new(sock_path: &str, timeout: Duration, conn_retries: u32) -> Self {
        Self {
            rpc: RpcClient::new(sock_path, timeout, conn_retries),
            engine_lock: Mutex::new(()),
        }
    }

    /// Eagerly connect to the engine socket.
    pub async fn connect(&self) -> Result<()> {
        self.rpc.connect().await.map_err(|source| TgtError {
            method: "<connect>".to_string(),
            source,
        })
    }

    /// Engine lock serializing every state transition into the engine, also
    /// held while reading engine snapshots to avoid torn views.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.engine_lock.lock().await
    }

    async fn call<A, R>(&self, method: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: 'static + DeserializeOwned + Send,
    {
        self.rpc
            .call(method, args)
            .await
            .map_err(|source| TgtError {
                method: method.to_string(),
                source,
            })
    }

    /// Create a fabrics transport; extra options are passed through verbatim.
    pub async fn create_transport(
        &self,
        trtype: &str,
        extra: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut params = serde_json::Map::new();
        params.insert("trtype".to_string(), trtype.into());
        if let Some(serde_json::Value::Object(extra)) = extra {
            params.extend(extra);
        }
        self.call("nvmf_create_transport", Some(params)).await
    }

    pub async fn create_subsystem(
        &self,
        nqn: &str,
        serial: &str,
        max_namespaces: u32,
        allow_any_host: bool,
    ) -> Result<bool> {
        self.call(
            "nvmf_create_subsystem",
            Some(CreateSubsystemArgs {
                nqn: nqn.to_string(),
                serial_number: serial.to_string(),
                max_namespaces,
                ana_reporting: true,
                allow_any_host,
            }),
        )
        .await
    }

    pub async fn delete_subsystem(&self, nqn: &str) -> Result<bool> {
        self.call(
            "nvmf_delete_subsystem",
            Some(SubsystemNqnArgs {
                nqn: nqn.to_string(),
            }),
        )
        .await
    }

    /// Attach a namespace to a subsystem; returns the assigned nsid.
    pub async fn add_namespace(
        &self,
        nqn: &str,
        bdev_name: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
        anagrpid: u32,
        auto_visible: bool,
    ) -> Result<u32> {
        self.call(
            "nvmf_subsystem_add_ns",
            Some(AddNamespaceArgs {
                nqn: nqn.to_string(),
                namespace: NamespaceParams {
                    bdev_name: bdev_name.to_string(),
                    nsid,
                    uuid: uuid.map(|u| u.to_string()),
                    anagrpid,
                    auto_visible,
                },
            }),
        )
        .await
    }

    pub async fn remove_namespace(&self, nqn: &str, nsid: u32) -> Result<bool> {
        self.call(
            "nvmf_subsystem_remove_ns",
            Some(RemoveNamespaceArgs {
                nqn: nqn.to_string(),
                nsid,
            }),
        )
        .await
    }

    pub async fn set_ns_ana_group(
        &self,
        nqn: &str,
        nsid: u32,
        anagrpid: u32,
    ) -> Result<bool> {
        self.call(
            "nvmf_subsystem_set_ns_ana_group",
            Some(SetNsAnaGroupArgs {
                nqn: nqn.to_string(),
                nsid,
                anagrpid,
            }),
        )
        .await
    }

    pub async fn ns_add_host(
        &self,
        nqn: &str,
        nsid: u32,
        host: &str,
    ) -> Result<bool> {
        self.call(
            "nvmf_ns_add_host",
            Some(NsVisibilityArgs {
                nqn: nqn.to_string(),
                nsid,
                host: host.to_string(),
            }),
        )
        .await
    }

    pub async fn ns_remove_host(
        &self,
        nqn: &str,
        nsid: u32,
        host: &str,
    ) -> Result<bool> {
        self.call(
            "nvmf_ns_remove_host",
            Some(NsVisibilityArgs {
                nqn: nqn.to_string(),
                nsid,
                host: host.to_string(),
            }),
        )
        .await
    }

    pub async fn add_listener(
        &self,
        nqn: &str,
        address: ListenAddress,
        secure: bool,
    ) -> Result<bool> {
        self.call(
            "nvmf_subsystem_add_listener",
            Some(AddListenerArgs {
                nqn: nqn.to_string(),
                listen_address: address,
                secure_channel: secure,
            }),
        )
        .await
    }

    pub async fn remove_listener(
        &self,
        nqn: &str,
        address: ListenAddress,
    ) -> Result<bool> {
        self.call(
            "nvmf_subsystem_remove_listener",
            Some(RemoveListenerArgs {
                nqn: nqn.to_string(),
                listen_address: address,
            }),
        )
        .await
    }

    /// Publish the ANA state of one group on one listener.
    pub async fn listener_set_ana_state(
        &self,
        nqn: &str,
        address: ListenAddress,
        state: AnaState,
        anagrpid: u32,
    ) -> Result<bool> {
        self.call(
            "nvmf_subsystem_listener_set_ana_state",
            Some(ListenerAnaStateArgs {
                nqn: nqn.to_string(),
                listen_address: address,
                ana_state: state.tgt_name().to_string(),
                anagrpid,
            }),
        )
        .await
    }

    pub async fn add_host(
        &self,
        nqn: &str,
        host: &str,
        psk: Option<&str>,
        dhchap_key: Option<&str>,
        dhchap_ctrlr_key: Option<&str>,
    ) -> Result<bool> {
        self.call(
            "nvmf_subsystem_add_host",
            Some(AddHostArgs {
                nqn: nqn.to_string(),
                host: host.to_string(),
                psk: psk.map(|k| k.to_string()),
                dhchap_key: dhchap_key.map(|k| k.to_string()),
                dhchap_ctrlr_key: dhchap_ctrlr_key.map(|k| k.to_string()),
            }),
        )
        .await
    }

    pub async fn remove_host(&self, nqn: &str, host: &str) -> Result<bool> {
        self.call(
            "nvmf_subsystem_remove_host",
            Some(RemoveHostArgs {
                nqn: nqn.to_string(),
                host: host.to_string(),
            }),
        )
        .await
    }

    pub async fn allow_any_host(&self, nqn: &str, allow: bool) -> Result<bool> {
        self.call(
            "nvmf_subsystem_allow_any_host",
            Some(AllowAnyHostArgs {
                nqn: nqn.to_string(),
                allow_any_host: allow,
            }),
        )
        .await
    }

    pub async fn get_subsystems(&self) -> Result<Vec<TgtSubsystem>> {
        self.call("nvmf_get_subsystems", None::<()>).await
    }

    pub async fn get_controllers(
        &self,
        nqn: &str,
    ) -> Result<Vec<TgtController>> {
        self.call(
            "nvmf_subsystem_get_controllers",
            Some(SubsystemNqnArgs {
                nqn: nqn.to_string(),
            }),
        )
        .await
    }

    pub async fn get_listeners(&self, nqn: &str) -> Result<Vec<TgtListener>> {
        self.call(
            "nvmf_subsystem_get_listeners",
            Some(SubsystemNqnArgs {
                nqn: nqn.to_string(),
            }),
        )
        .await
    }

    /// Create an rbd backed bdev; returns the bdev name.
    pub async fn bdev_rbd_create(
        &self,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
        uuid: Option<&str>,
    ) -> Result<String> {
        self.call(
            "bdev_rbd_create",
            Some(BdevRbdCreateArgs {
                name: name.to_string(),
                pool_name: pool.to_string(),
                rbd_name: image.to_string(),
                block_size,
                uuid: uuid.map(|u| u.to_string()),
            }),
        )
        .await
    }

    pub async fn bdev_rbd_delete(&self, name: &str) -> Result<bool> {
        self.call(
            "bdev_rbd_delete",
            Some(BdevNameArgs {
                name: name.to_string(),
            }),
        )
        .await
    }

    /// Grow an rbd bdev; the engine takes the new size in MiB.
    pub async fn bdev_rbd_resize(
        &self,
        name: &str,
        new_size_mib: u64,
    ) -> Result<bool> {
        self.call(
            "bdev_rbd_resize",
            Some(BdevRbdResizeArgs {
                name: name.to_string(),
                new_size: new_size_mib,
            }),
        )
        .await
    }

    pub async fn keyring_add_key(&self, name: &str, path: &str) -> Result<()> {
        self.call(
            "keyring_file_add_key",
            Some(KeyringAddKeyArgs {
                name: name.to_string(),
                path: path.to_string(),
            }),
        )
        .await
    }

    pub async fn keyring_remove_key(&self, name: &str) -> Result<()> {
        self.call(
            "keyring_file_remove_key",
            Some(KeyringKeyNameArgs {
                name: name.to_string(),
            }),
        )
        .await
    }

    pub async fn log_set_level(&self, level: &str) -> Result<bool> {
        self.call(
            "log_set_level",
            Some(LogLevelArgs {
                level: level.to_string(),
            }),
        )
        .await
    }

    pub async fn log_set_print_level(&self, level: &str) -> Result<bool> {
        self.call(
            "log_set_print_level",
            Some(LogLevelArgs {
                level: level.to_string(),
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_args_omit_unset_fields() {
        let args = AddNamespaceArgs {
            nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            namespace: NamespaceParams {
                bdev_name: "bdev_0".to_string(),
                nsid: None,
                uuid: None,
                anagrpid: 1,
                auto_visible: true,
            },
        };
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(
            value,
            json!({
                "nqn": "nqn.2016-06.io.spdk:cnode1",
                "namespace": {
                    "bdev_name": "bdev_0",
                    "anagrpid": 1,
                    "auto_visible": true,
                }
            })
        );
    }

    #[test]
    fn host_args_carry_key_names_only() {
        let args = AddHostArgs {
            nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            host: "nqn.2014-08.org.nvmexpress:uuid:host".to_string(),
            psk: Some("psk_cnode1_3a1f".to_string()),
            dhchap_key: None,
            dhchap_ctrlr_key: None,
        };
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["psk"], json!("psk_cnode1_3a1f"));
        assert!(value.get("dhchap_key").is_none());
    }

    #[test]
    fn engine_enum_names() {
        assert_eq!(AnaState::Optimized.tgt_name(), "optimized");
        assert_eq!(AnaState::Inaccessible.tgt_name(), "inaccessible");
        assert_eq!(AddressFamily::Ipv4.tgt_name(), "ipv4");
    }

    #[test]
    fn subsystem_enumeration_tolerates_unknown_fields() {
        let raw = json!([{
            "nqn": "nqn.2016-06.io.spdk:cnode1",
            "subtype": "NVMe",
            "listen_addresses": [{
                "trtype": "TCP",
                "adrfam": "ipv4",
                "traddr": "192.168.13.3",
                "trsvcid": "4420"
            }],
            "hosts": [],
            "allow_any_host": true,
            "serial_number": "SPDK00000001",
            "max_namespaces": 256,
            "min_cntlid": 1,
            "max_cntlid": 65519,
            "namespaces": [{
                "nsid": 1,
                "bdev_name": "bdev_0",
                "name": "bdev_0",
                "anagrpid": 1
            }]
        }]);
        let subs: Vec<TgtSubsystem> = serde_json::from_value(raw).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].namespaces[0].nsid, 1);
        assert_eq!(subs[0].listen_addresses[0].trsvcid, "4420");
    }
}
