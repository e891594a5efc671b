//! State map key scheme. Keys are prefixed by entity kind and natural
//! identifier; none of the identifier components may contain '/'.

use crate::state::records::{AddressFamily, KeyKind};
use std::fmt;
use std::str::FromStr;

/// Typed form of a state map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKey {
    Subsystem {
        nqn: String,
    },
    Namespace {
        nqn: String,
        nsid: u32,
    },
    Listener {
        nqn: String,
        gateway: String,
        adrfam: AddressFamily,
        traddr: String,
        trsvcid: u16,
    },
    Host {
        nqn: String,
        host_nqn: String,
    },
    Key {
        nqn: String,
        host_nqn: String,
        kind: KeyKind,
    },
    Gateway {
        name: String,
    },
    AnaGroup {
        grp: u32,
    },
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Subsystem { nqn } => write!(f, "sub/{}", nqn),
            StateKey::Namespace { nqn, nsid } => {
                write!(f, "ns/{}/{}", nqn, nsid)
            }
            StateKey::Listener {
                nqn,
                gateway,
                adrfam,
                traddr,
                trsvcid,
            } => write!(
                f,
                "lst/{}/{}/{}/{}/{}",
                nqn, gateway, adrfam, traddr, trsvcid
            ),
            StateKey::Host { nqn, host_nqn } => {
                write!(f, "hst/{}/{}", nqn, host_nqn)
            }
            StateKey::Key {
                nqn,
                host_nqn,
                kind,
            } => write!(f, "key/{}/{}/{}", nqn, host_nqn, kind),
            StateKey::Gateway { name } => write!(f, "gw/{}", name),
            StateKey::AnaGroup { grp } => write!(f, "ana/{}", grp),
        }
    }
}

impl FromStr for StateKey {
    type Err = ();

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        match (parts.first().copied(), parts.len()) {
            (Some("sub"), 2) => Ok(StateKey::Subsystem {
                nqn: parts[1].to_string(),
            }),
            (Some("ns"), 3) => Ok(StateKey::Namespace {
                nqn: parts[1].to_string(),
                nsid: parts[2].parse().map_err(|_| ())?,
            }),
            (Some("lst"), 6) => Ok(StateKey::Listener {
                nqn: parts[1].to_string(),
                gateway: parts[2].to_string(),
                adrfam: parts[3].parse().map_err(|_| ())?,
                traddr: parts[4].to_string(),
                trsvcid: parts[5].parse().map_err(|_| ())?,
            }),
            (Some("hst"), 3) => Ok(StateKey::Host {
                nqn: parts[1].to_string(),
                host_nqn: parts[2].to_string(),
            }),
            (Some("key"), 4) => Ok(StateKey::Key {
                nqn: parts[1].to_string(),
                host_nqn: parts[2].to_string(),
                kind: parts[3].parse().map_err(|_| ())?,
            }),
            (Some("gw"), 2) => Ok(StateKey::Gateway {
                name: parts[1].to_string(),
            }),
            (Some("ana"), 2) => Ok(StateKey::AnaGroup {
                grp: parts[1].parse().map_err(|_| ())?,
            }),
            _ => Err(()),
        }
    }
}

/// Prefix of all subsystem records.
pub fn subsystems_prefix() -> &'static str {
    "sub/"
}

/// Prefix of the namespaces of one subsystem.
pub fn namespaces_prefix(nqn: &str) -> String {
    format!("ns/{}/", nqn)
}

/// Prefix of the listeners of one subsystem (all gateways).
pub fn listeners_prefix(nqn: &str) -> String {
    format!("lst/{}/", nqn)
}

/// Prefix of the host ACL of one subsystem.
pub fn hosts_prefix(nqn: &str) -> String {
    format!("hst/{}/", nqn)
}

/// Prefix of the key records of one subsystem.
pub fn keys_prefix(nqn: &str) -> String {
    format!("key/{}/", nqn)
}

/// Prefix of the key records of one host of one subsystem.
pub fn host_keys_prefix(nqn: &str, host_nqn: &str) -> String {
    format!("key/{}/{}/", nqn, host_nqn)
}

/// Prefix of all gateway identity records.
pub fn gateways_prefix() -> &'static str {
    "gw/"
}

/// Prefix of all ANA group ownership records.
pub fn ana_groups_prefix() -> &'static str {
    "ana/"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let keys = vec![
            StateKey::Subsystem {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
            },
            StateKey::Namespace {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                nsid: 7,
            },
            StateKey::Listener {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                gateway: "gw-1".into(),
                adrfam: AddressFamily::Ipv4,
                traddr: "192.168.13.3".into(),
                trsvcid: 4420,
            },
            StateKey::Host {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                host_nqn: "*".into(),
            },
            StateKey::Key {
                nqn: "nqn.2016-06.io.spdk:cnode1".into(),
                host_nqn: "nqn.2014-08.org.nvmexpress:uuid:host1".into(),
                kind: KeyKind::Psk,
            },
            StateKey::Gateway { name: "gw-1".into() },
            StateKey::AnaGroup { grp: 2 },
        ];
        for key in keys {
            let text = key.to_string();
            let parsed: StateKey = text.parse().unwrap();
            assert_eq!(parsed, key, "roundtrip of {}", text);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<StateKey>().is_err());
        assert!("bogus/x".parse::<StateKey>().is_err());
        assert!("ns/nqn".parse::<StateKey>().is_err());
        assert!("ns/nqn/notanumber".parse::<StateKey>().is_err());
    }
}
