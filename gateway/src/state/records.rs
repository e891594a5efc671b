//! Domain records persisted in the state map. These are the authoritative
//! cluster-scoped descriptions of every configuration entity; the local
//! target engine state is a derived projection of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum_macros::{Display, EnumString};

/// Address family of a listener.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Kind of an authentication key.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    #[strum(serialize = "psk")]
    #[serde(rename = "psk")]
    Psk,
    #[strum(serialize = "dhchap")]
    #[serde(rename = "dhchap")]
    Dhchap,
    #[strum(serialize = "dhchap-ctrlr")]
    #[serde(rename = "dhchap-ctrlr")]
    DhchapCtrlr,
}

/// ANA access state advertised for one group on one gateway.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AnaState {
    Optimized,
    Inaccessible,
}

/// One NVMe subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubsystemRecord {
    pub nqn: String,
    pub serial: String,
    pub max_namespaces: u32,
    pub allow_any_host: bool,
    pub created_without_group_append: bool,
}

/// One namespace, backed by an rbd image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceRecord {
    pub nqn: String,
    pub nsid: u32,
    pub pool: String,
    pub image: String,
    pub size: u64,
    pub block_size: u32,
    pub uuid: String,
    pub anagrpid: u32,
    pub auto_visible: bool,
    /// Hosts the namespace is visible to when not auto visible.
    #[serde(default)]
    pub visible_hosts: BTreeSet<String>,
}

/// One listener. Realized in the local engine only by the owning gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerRecord {
    pub nqn: String,
    pub gateway: String,
    pub transport: String,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    pub secure: bool,
}

/// One host ACL entry; `host_nqn` may be the `"*"` wildcard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub nqn: String,
    pub host_nqn: String,
    #[serde(default)]
    pub use_psk: bool,
    #[serde(default)]
    pub use_dhchap: bool,
}

impl HostRecord {
    pub fn is_wildcard(&self) -> bool {
        self.host_nqn == "*"
    }
}

/// Encrypted key material replicated through the state map. The plaintext is
/// sealed under the gateway-group secret; each peer opens it locally, writes
/// its own key file and registers with its own engine keyring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyRecord {
    pub nqn: String,
    pub host_nqn: String,
    pub kind: KeyKind,
    /// AES-GCM nonce, hex encoded.
    pub nonce: String,
    /// Ciphertext, hex encoded.
    pub ciphertext: String,
}

/// Identity of one running gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayRecord {
    pub name: String,
    pub group: String,
    pub addr: String,
    pub grpc_port: u16,
    pub io_port: u16,
    pub discovery_port: u16,
}

/// Ownership of one ANA group: the gateway currently advertising it as
/// optimized, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnaGroupRecord {
    pub grp: u32,
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_family_text_forms() {
        assert_eq!(AddressFamily::Ipv4.to_string(), "ipv4");
        assert_eq!(
            "ipv6".parse::<AddressFamily>().unwrap(),
            AddressFamily::Ipv6
        );
    }

    #[test]
    fn key_kind_text_forms() {
        assert_eq!(KeyKind::Psk.to_string(), "psk");
        assert_eq!(KeyKind::DhchapCtrlr.to_string(), "dhchap-ctrlr");
        assert_eq!(
            "dhchap-ctrlr".parse::<KeyKind>().unwrap(),
            KeyKind::DhchapCtrlr
        );
    }

    #[test]
    fn namespace_record_serde_defaults() {
        // visible_hosts was added later, old records must still parse
        let old = r#"{
            "nqn": "nqn.2016-06.io.spdk:cnode1",
            "nsid": 1,
            "pool": "rbd",
            "image": "demo",
            "size": 10485760,
            "block_size": 512,
            "uuid": "7c1a1f0e-9fd6-4a96-b8f0-1f6ee906ec1c",
            "anagrpid": 1,
            "auto_visible": true
        }"#;
        let rec: NamespaceRecord = serde_json::from_str(old).unwrap();
        assert!(rec.visible_hosts.is_empty());
    }
}
