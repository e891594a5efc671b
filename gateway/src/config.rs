//! Gateway configuration, loaded from an INI file with sections `[gateway]`,
//! `[ceph]`, `[mtls]`, `[spdk]` and `[discovery]`.
//!
//! Partial config files are supported: every option has a default and only
//! the options present in the file are overridden. Unknown sections are
//! logged and ignored so configs can be shared across gateway versions.

use ini::Ini;
use snafu::{ResultExt, Snafu};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read config file '{}': {}", path, source))]
    Load { path: String, source: ini::Error },
    #[snafu(display(
        "Invalid value '{}' for option {}.{}",
        value,
        section,
        option
    ))]
    InvalidValue {
        section: String,
        option: String,
        value: String,
    },
}

/// `[gateway]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOpts {
    /// Unique name of this gateway; defaults to the hostname.
    pub name: String,
    /// Gateway group; scopes the state map and the monitor registration.
    pub group: String,
    /// Address the gRPC server binds to.
    pub addr: String,
    /// Port of the gRPC server.
    pub port: u16,
    /// Default port the io listeners use.
    pub io_port: u16,
    /// Require mTLS client authentication on the admin socket.
    pub enable_auth: bool,
    pub enable_prometheus_exporter: bool,
    pub prometheus_port: u16,
    /// Name of the state map object inside the pool.
    pub state_object: String,
    /// File holding the gateway-group secret key material is sealed under.
    pub encryption_key_file: String,
    /// Directory keeping the per subsystem key files.
    pub keyring_dir: String,
}

impl Default for GatewayOpts {
    fn default() -> Self {
        Self {
            name: default_hostname(),
            group: String::new(),
            addr: "0.0.0.0".to_string(),
            port: 5500,
            io_port: 4420,
            enable_auth: false,
            enable_prometheus_exporter: false,
            prometheus_port: 10008,
            state_object: "nvmeof.state".to_string(),
            encryption_key_file: "/etc/nvmeof-gw/encryption.key".to_string(),
            keyring_dir: "/var/tmp".to_string(),
        }
    }
}

/// `[ceph]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CephOpts {
    /// Pool holding the rbd images and the state object.
    pub pool: String,
    pub config_file: String,
    /// Endpoint of the shared state store client.
    pub state_endpoint: String,
}

impl Default for CephOpts {
    fn default() -> Self {
        Self {
            pool: "rbd".to_string(),
            config_file: "/etc/ceph/ceph.conf".to_string(),
            state_endpoint: "localhost:2379".to_string(),
        }
    }
}

/// `[mtls]` section; only consulted when `gateway.enable_auth` is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MtlsOpts {
    pub server_key: String,
    pub client_key: String,
    pub server_cert: String,
    pub client_cert: String,
}

/// `[spdk]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct SpdkOpts {
    /// Path of the engine's json-rpc unix socket.
    pub rpc_socket: String,
    /// Per-call timeout towards the engine.
    pub timeout: Duration,
    pub log_level: String,
    /// Connect attempts before the engine is declared unreachable.
    pub conn_retries: u32,
    pub tgt_cmd_extra_args: String,
    pub transports: String,
    /// Extra json options passed when creating the tcp transport.
    pub transport_tcp_options: String,
}

impl Default for SpdkOpts {
    fn default() -> Self {
        Self {
            rpc_socket: "/var/tmp/spdk.sock".to_string(),
            timeout: Duration::from_secs(60),
            log_level: "WARNING".to_string(),
            conn_retries: 3,
            tgt_cmd_extra_args: String::new(),
            transports: "tcp".to_string(),
            transport_tcp_options: String::new(),
        }
    }
}

/// `[discovery]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryOpts {
    pub addr: String,
    pub port: u16,
}

impl Default for DiscoveryOpts {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 8009,
        }
    }
}

/// Main config structure of the gateway.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GwConfig {
    pub gateway: GatewayOpts,
    pub ceph: CephOpts,
    pub mtls: MtlsOpts,
    pub spdk: SpdkOpts,
    pub discovery: DiscoveryOpts,
}

fn default_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "nvmeof-gw".to_string())
}

struct Section<'a> {
    name: &'a str,
    props: Option<&'a ini::Properties>,
}

impl<'a> Section<'a> {
    fn string(&self, option: &str, default: &str) -> String {
        self.props
            .and_then(|p| p.get(option))
            .map(|v| v.to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(
        &self,
        option: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.props.and_then(|p| p.get(option)) {
            None => Ok(default),
            Some(value) => {
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    section: self.name.to_string(),
                    option: option.to_string(),
                    value: value.to_string(),
                })
            }
        }
    }

    fn bool(&self, option: &str, default: bool) -> Result<bool, ConfigError> {
        match self.props.and_then(|p| p.get(option)) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    section: self.name.to_string(),
                    option: option.to_string(),
                    value: value.to_string(),
                }),
            },
        }
    }
}

impl GwConfig {
    /// Load the configuration from an INI file, filling in defaults for
    /// anything the file does not mention.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let ini = Ini::load_from_file(path.as_ref()).context(LoadSnafu {
            path: path_str,
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        for (section, _) in ini.iter() {
            match section {
                Some("gateway") | Some("ceph") | Some("mtls")
                | Some("spdk") | Some("discovery") => {}
                Some(other) => {
                    warn!("Ignoring unknown config section [{}]", other)
                }
                None => {}
            }
        }

        let section = |name: &'static str| Section {
            name,
            props: ini.section(Some(name)),
        };

        let gw = section("gateway");
        let gw_defaults = GatewayOpts::default();
        let gateway = GatewayOpts {
            name: gw.string("name", &gw_defaults.name),
            group: gw.string("group", &gw_defaults.group),
            addr: gw.string("addr", &gw_defaults.addr),
            port: gw.parse("port", gw_defaults.port)?,
            io_port: gw.parse("io_port", gw_defaults.io_port)?,
            enable_auth: gw.bool("enable_auth", gw_defaults.enable_auth)?,
            enable_prometheus_exporter: gw.bool(
                "enable_prometheus_exporter",
                gw_defaults.enable_prometheus_exporter,
            )?,
            prometheus_port: gw
                .parse("prometheus_port", gw_defaults.prometheus_port)?,
            state_object: gw
                .string("state_object", &gw_defaults.state_object),
            encryption_key_file: gw.string(
                "encryption_key_file",
                &gw_defaults.encryption_key_file,
            ),
            keyring_dir: gw
                .string("keyring_dir", &gw_defaults.keyring_dir),
        };

        let ceph = section("ceph");
        let ceph_defaults = CephOpts::default();
        let ceph = CephOpts {
            pool: ceph.string("pool", &ceph_defaults.pool),
            config_file: ceph
                .string("config_file", &ceph_defaults.config_file),
            state_endpoint: ceph
                .string("state_endpoint", &ceph_defaults.state_endpoint),
        };

        let mtls = section("mtls");
        let mtls = MtlsOpts {
            server_key: mtls.string("server_key", ""),
            client_key: mtls.string("client_key", ""),
            server_cert: mtls.string("server_cert", ""),
            client_cert: mtls.string("client_cert", ""),
        };

        let spdk = section("spdk");
        let spdk_defaults = SpdkOpts::default();
        let timeout_secs: f64 = spdk.parse(
            "timeout",
            spdk_defaults.timeout.as_secs_f64(),
        )?;
        let spdk = SpdkOpts {
            rpc_socket: spdk
                .string("rpc_socket", &spdk_defaults.rpc_socket),
            timeout: Duration::from_secs_f64(timeout_secs),
            log_level: spdk.string("log_level", &spdk_defaults.log_level),
            conn_retries: spdk
                .parse("conn_retries", spdk_defaults.conn_retries)?,
            tgt_cmd_extra_args: spdk.string("tgt_cmd_extra_args", ""),
            transports: spdk
                .string("transports", &spdk_defaults.transports),
            transport_tcp_options: spdk
                .string("transport_tcp_options", ""),
        };

        let discovery = section("discovery");
        let discovery_defaults = DiscoveryOpts::default();
        let discovery = DiscoveryOpts {
            addr: discovery.string("addr", &discovery_defaults.addr),
            port: discovery.parse("port", discovery_defaults.port)?,
        };

        Ok(Self {
            gateway,
            ceph,
            mtls,
            spdk,
            discovery,
        })
    }

    /// gRPC bind endpoint.
    pub fn grpc_endpoint(&self) -> String {
        format!("{}:{}", self.gateway.addr, self.gateway.port)
    }

    /// State map prefix shared by the gateway group.
    pub fn state_prefix(&self) -> String {
        format!(
            "{}/{}/{}/",
            self.ceph.pool, self.gateway.state_object, self.gateway.group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(content: &str) -> Result<GwConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        GwConfig::from_file(file.path())
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = load("").unwrap();
        assert_eq!(config.gateway.port, 5500);
        assert_eq!(config.spdk.rpc_socket, "/var/tmp/spdk.sock");
        assert_eq!(config.spdk.timeout, Duration::from_secs(60));
        assert_eq!(config.discovery.port, 8009);
    }

    #[test]
    fn partial_file_overrides() {
        let config = load(
            "[gateway]\n\
             name = gw-1\n\
             group = group1\n\
             port = 5501\n\
             enable_auth = yes\n\
             \n\
             [spdk]\n\
             rpc_socket = /tmp/engine.sock\n\
             timeout = 2.5\n\
             conn_retries = 5\n",
        )
        .unwrap();
        assert_eq!(config.gateway.name, "gw-1");
        assert_eq!(config.gateway.group, "group1");
        assert_eq!(config.gateway.port, 5501);
        assert!(config.gateway.enable_auth);
        // untouched section keeps defaults
        assert_eq!(config.ceph.pool, "rbd");
        assert_eq!(config.spdk.rpc_socket, "/tmp/engine.sock");
        assert_eq!(config.spdk.timeout, Duration::from_secs_f64(2.5));
        assert_eq!(config.spdk.conn_retries, 5);
    }

    #[test]
    fn bad_value_is_rejected() {
        let err = load("[gateway]\nport = not-a-port\n").unwrap_err();
        match err {
            ConfigError::InvalidValue {
                section, option, ..
            } => {
                assert_eq!(section, "gateway");
                assert_eq!(option, "port");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn state_prefix_scopes_by_group() {
        let config = load(
            "[gateway]\ngroup = group1\n[ceph]\npool = nvmeof\n",
        )
        .unwrap();
        assert_eq!(config.state_prefix(), "nvmeof/nvmeof.state/group1/");
    }
}
