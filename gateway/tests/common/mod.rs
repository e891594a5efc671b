//! Shared test harness: a scripted target engine behind a real unix socket
//! plus a gateway context wired to it and to a shared in-memory state map.
//! Several gateways can be built against the same map to exercise peer
//! behavior in-process.

#![allow(dead_code)]

use nvmeof_gw::{
    config::GwConfig,
    context::{GwContext, Health, PendingApplies},
    core::lock::SubsystemLocks,
    ha::AnaGroups,
    keyring::Keyring,
    reconciler::Reconciler,
    state::map::StateMap,
    store::mem::MemStore,
    tgt::TgtClient,
};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixListener,
};

const ENOENT: i32 = -2;
const EEXIST: i32 = -17;

#[derive(Debug, Default, Clone)]
pub struct FakeNamespace {
    pub bdev_name: String,
    pub uuid: String,
    pub anagrpid: u32,
    pub auto_visible: bool,
    pub hosts: BTreeSet<String>,
}

#[derive(Debug, Default, Clone)]
pub struct FakeHost {
    pub psk: Option<String>,
    pub dhchap_key: Option<String>,
    pub dhchap_ctrlr_key: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct FakeSubsystem {
    pub serial: String,
    pub max_namespaces: u32,
    pub allow_any_host: bool,
    pub namespaces: BTreeMap<u32, FakeNamespace>,
    /// (adrfam, traddr, trsvcid) -> secure
    pub listeners: BTreeMap<(String, String, String), bool>,
    /// ((adrfam, traddr, trsvcid), anagrpid) -> state
    pub ana_states: BTreeMap<((String, String, String), u32), String>,
    pub hosts: BTreeMap<String, FakeHost>,
}

#[derive(Debug, Default, Clone)]
pub struct FakeBdev {
    pub pool: String,
    pub image: String,
    pub uuid: Option<String>,
    pub size_mib: u64,
}

#[derive(Debug, Clone)]
pub struct FakeController {
    pub cntlid: u16,
    pub hostnqn: String,
    pub num_io_qpairs: u32,
}

/// In-memory model of the engine.
#[derive(Debug, Default)]
pub struct FakeTgtState {
    pub transports: BTreeSet<String>,
    pub subsystems: BTreeMap<String, FakeSubsystem>,
    pub bdevs: BTreeMap<String, FakeBdev>,
    /// keyring name -> file path
    pub keyring: BTreeMap<String, String>,
    pub controllers: BTreeMap<String, Vec<FakeController>>,
    pub log_level: String,
    /// every (method, params) the engine ever saw
    pub transcript: Vec<(String, Value)>,
}

#[derive(Clone)]
pub struct FakeTgt {
    pub state: Arc<parking_lot::Mutex<FakeTgtState>>,
    pub sock_path: PathBuf,
}

fn rpc_err(id: Value, code: i32, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
    .to_string()
}

fn rpc_ok(id: Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn addr_key(la: &Value) -> (String, String, String) {
    (
        la["adrfam"].as_str().unwrap_or_default().to_lowercase(),
        la["traddr"].as_str().unwrap_or_default().to_string(),
        la["trsvcid"].as_str().unwrap_or_default().to_string(),
    )
}

impl FakeTgt {
    /// Bind the scripted engine on a fresh socket in `dir`.
    pub fn spawn(dir: &std::path::Path, name: &str) -> Self {
        let sock_path = dir.join(format!("{}.sock", name));
        let listener = UnixListener::bind(&sock_path).unwrap();
        let state = Arc::new(parking_lot::Mutex::new(FakeTgtState {
            log_level: "WARNING".to_string(),
            ..Default::default()
        }));
        let tgt = Self {
            state: state.clone(),
            sock_path,
        };
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let (rd, mut wr) = stream.into_split();
                    let mut lines = BufReader::new(rd).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value =
                            serde_json::from_str(&line).unwrap();
                        let mut reply = dispatch(&state, &req);
                        reply.push('\n');
                        if wr.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        tgt
    }

    pub fn client(&self) -> TgtClient {
        TgtClient::new(
            self.sock_path.to_str().unwrap(),
            Duration::from_secs(5),
            3,
        )
    }

    /// Pretend a host is connected with some qpairs.
    pub fn connect_controller(
        &self,
        nqn: &str,
        hostnqn: &str,
        cntlid: u16,
        qpairs: u32,
    ) {
        self.state
            .lock()
            .controllers
            .entry(nqn.to_string())
            .or_default()
            .push(FakeController {
                cntlid,
                hostnqn: hostnqn.to_string(),
                num_io_qpairs: qpairs,
            });
    }
}

fn dispatch(
    state: &Arc<parking_lot::Mutex<FakeTgtState>>,
    req: &Value,
) -> String {
    let id = req["id"].clone();
    let method = req["method"].as_str().unwrap_or_default().to_string();
    let p = req.get("params").cloned().unwrap_or(Value::Null);
    let mut s = state.lock();
    s.transcript.push((method.clone(), p.clone()));

    let nqn = p["nqn"].as_str().unwrap_or_default().to_string();
    match method.as_str() {
        "nvmf_create_transport" => {
            let trtype =
                p["trtype"].as_str().unwrap_or_default().to_lowercase();
            if !s.transports.insert(trtype) {
                return rpc_err(id, EEXIST, "transport exists");
            }
            rpc_ok(id, json!(true))
        }
        "nvmf_create_subsystem" => {
            if s.subsystems.contains_key(&nqn) {
                return rpc_err(id, EEXIST, "subsystem exists");
            }
            s.subsystems.insert(
                nqn,
                FakeSubsystem {
                    serial: p["serial_number"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    max_namespaces: p["max_namespaces"]
                        .as_u64()
                        .unwrap_or(32) as u32,
                    allow_any_host: p["allow_any_host"]
                        .as_bool()
                        .unwrap_or(false),
                    ..Default::default()
                },
            );
            rpc_ok(id, json!(true))
        }
        "nvmf_delete_subsystem" => {
            if s.subsystems.remove(&nqn).is_none() {
                return rpc_err(id, ENOENT, "no subsystem");
            }
            s.controllers.remove(&nqn);
            rpc_ok(id, json!(true))
        }
        "nvmf_subsystem_allow_any_host" => {
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    sub.allow_any_host =
                        p["allow_any_host"].as_bool().unwrap_or(false);
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no subsystem"),
            }
        }
        "nvmf_subsystem_add_ns" => {
            let ns = &p["namespace"];
            let bdev_name =
                ns["bdev_name"].as_str().unwrap_or_default().to_string();
            if !s.bdevs.contains_key(&bdev_name) {
                return rpc_err(id, ENOENT, "no bdev");
            }
            let Some(sub) = s.subsystems.get_mut(&nqn) else {
                return rpc_err(id, ENOENT, "no subsystem");
            };
            let nsid = match ns["nsid"].as_u64() {
                Some(nsid) => nsid as u32,
                None => (1 ..= sub.max_namespaces)
                    .find(|n| !sub.namespaces.contains_key(n))
                    .unwrap_or(0),
            };
            if sub.namespaces.contains_key(&nsid) {
                return rpc_err(id, EEXIST, "nsid in use");
            }
            sub.namespaces.insert(
                nsid,
                FakeNamespace {
                    bdev_name,
                    uuid: ns["uuid"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    anagrpid: ns["anagrpid"].as_u64().unwrap_or(1) as u32,
                    auto_visible: ns["auto_visible"]
                        .as_bool()
                        .unwrap_or(true),
                    hosts: Default::default(),
                },
            );
            rpc_ok(id, json!(nsid))
        }
        "nvmf_subsystem_remove_ns" => {
            let nsid = p["nsid"].as_u64().unwrap_or_default() as u32;
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if sub.namespaces.remove(&nsid).is_some() {
                        rpc_ok(id, json!(true))
                    } else {
                        rpc_err(id, ENOENT, "no namespace")
                    }
                }
                None => rpc_err(id, ENOENT, "no namespace"),
            }
        }
        "nvmf_subsystem_set_ns_ana_group" => {
            let nsid = p["nsid"].as_u64().unwrap_or_default() as u32;
            match s
                .subsystems
                .get_mut(&nqn)
                .and_then(|sub| sub.namespaces.get_mut(&nsid))
            {
                Some(ns) => {
                    ns.anagrpid =
                        p["anagrpid"].as_u64().unwrap_or(1) as u32;
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no namespace"),
            }
        }
        "nvmf_ns_add_host" | "nvmf_ns_remove_host" => {
            let nsid = p["nsid"].as_u64().unwrap_or_default() as u32;
            let host =
                p["host"].as_str().unwrap_or_default().to_string();
            match s
                .subsystems
                .get_mut(&nqn)
                .and_then(|sub| sub.namespaces.get_mut(&nsid))
            {
                Some(ns) => {
                    if method == "nvmf_ns_add_host" {
                        ns.hosts.insert(host);
                    } else {
                        ns.hosts.remove(&host);
                    }
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no namespace"),
            }
        }
        "nvmf_subsystem_add_listener" => {
            let key = addr_key(&p["listen_address"]);
            let secure =
                p["secure_channel"].as_bool().unwrap_or(false);
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if sub.listeners.contains_key(&key) {
                        return rpc_err(id, EEXIST, "listener exists");
                    }
                    sub.listeners.insert(key, secure);
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no subsystem"),
            }
        }
        "nvmf_subsystem_remove_listener" => {
            let key = addr_key(&p["listen_address"]);
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if sub.listeners.remove(&key).is_some() {
                        sub.ana_states.retain(|(k, _), _| k != &key);
                        rpc_ok(id, json!(true))
                    } else {
                        rpc_err(id, ENOENT, "no listener")
                    }
                }
                None => rpc_err(id, ENOENT, "no listener"),
            }
        }
        "nvmf_subsystem_listener_set_ana_state" => {
            let key = addr_key(&p["listen_address"]);
            let grp = p["anagrpid"].as_u64().unwrap_or_default() as u32;
            let ana_state = p["ana_state"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if !sub.listeners.contains_key(&key) {
                        return rpc_err(id, ENOENT, "no listener");
                    }
                    sub.ana_states.insert((key, grp), ana_state);
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no subsystem"),
            }
        }
        "nvmf_subsystem_add_host" => {
            let host =
                p["host"].as_str().unwrap_or_default().to_string();
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if sub.hosts.contains_key(&host) {
                        return rpc_err(id, EEXIST, "host exists");
                    }
                    sub.hosts.insert(
                        host,
                        FakeHost {
                            psk: p["psk"]
                                .as_str()
                                .map(|v| v.to_string()),
                            dhchap_key: p["dhchap_key"]
                                .as_str()
                                .map(|v| v.to_string()),
                            dhchap_ctrlr_key: p["dhchap_ctrlr_key"]
                                .as_str()
                                .map(|v| v.to_string()),
                        },
                    );
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no subsystem"),
            }
        }
        "nvmf_subsystem_remove_host" => {
            let host =
                p["host"].as_str().unwrap_or_default().to_string();
            match s.subsystems.get_mut(&nqn) {
                Some(sub) => {
                    if sub.hosts.remove(&host).is_some() {
                        rpc_ok(id, json!(true))
                    } else {
                        rpc_err(id, ENOENT, "no host")
                    }
                }
                None => rpc_err(id, ENOENT, "no host"),
            }
        }
        "nvmf_get_subsystems" => {
            let subs: Vec<Value> = s
                .subsystems
                .iter()
                .map(|(nqn, sub)| {
                    json!({
                        "nqn": nqn,
                        "subtype": "NVMe",
                        "serial_number": sub.serial,
                        "max_namespaces": sub.max_namespaces,
                        "allow_any_host": sub.allow_any_host,
                        "listen_addresses": sub.listeners.keys().map(
                            |(adrfam, traddr, trsvcid)| json!({
                                "trtype": "TCP",
                                "adrfam": adrfam,
                                "traddr": traddr,
                                "trsvcid": trsvcid,
                            })
                        ).collect::<Vec<_>>(),
                        "hosts": sub.hosts.keys().map(
                            |h| json!({ "nqn": h })
                        ).collect::<Vec<_>>(),
                        "namespaces": sub.namespaces.iter().map(
                            |(nsid, ns)| json!({
                                "nsid": nsid,
                                "bdev_name": ns.bdev_name,
                                "name": ns.bdev_name,
                                "uuid": ns.uuid,
                                "anagrpid": ns.anagrpid,
                                "auto_visible": ns.auto_visible,
                                "hosts": ns.hosts.iter().map(
                                    |h| json!({ "nqn": h })
                                ).collect::<Vec<_>>(),
                            })
                        ).collect::<Vec<_>>(),
                    })
                })
                .collect();
            rpc_ok(id, json!(subs))
        }
        "nvmf_subsystem_get_controllers" => {
            if !s.subsystems.contains_key(&nqn) {
                return rpc_err(id, ENOENT, "no subsystem");
            }
            let ctrls: Vec<Value> = s
                .controllers
                .get(&nqn)
                .map(|c| c.as_slice())
                .unwrap_or(&[])
                .iter()
                .map(|c| {
                    json!({
                        "cntlid": c.cntlid,
                        "hostnqn": c.hostnqn,
                        "hostid": "",
                        "num_io_qpairs": c.num_io_qpairs,
                    })
                })
                .collect();
            rpc_ok(id, json!(ctrls))
        }
        "nvmf_subsystem_get_listeners" => {
            match s.subsystems.get(&nqn) {
                Some(sub) => {
                    let listeners: Vec<Value> = sub
                        .listeners
                        .keys()
                        .map(|(adrfam, traddr, trsvcid)| {
                            let states: Vec<Value> = sub
                                .ana_states
                                .iter()
                                .filter(|((k, _), _)| {
                                    k == &(
                                        adrfam.clone(),
                                        traddr.clone(),
                                        trsvcid.clone(),
                                    )
                                })
                                .map(|((_, grp), state)| {
                                    json!({
                                        "ana_group": grp,
                                        "ana_state": state,
                                    })
                                })
                                .collect();
                            json!({
                                "address": {
                                    "trtype": "TCP",
                                    "adrfam": adrfam,
                                    "traddr": traddr,
                                    "trsvcid": trsvcid,
                                },
                                "ana_states": states,
                            })
                        })
                        .collect();
                    rpc_ok(id, json!(listeners))
                }
                None => rpc_err(id, ENOENT, "no subsystem"),
            }
        }
        "bdev_rbd_create" => {
            let name =
                p["name"].as_str().unwrap_or_default().to_string();
            if s.bdevs.contains_key(&name) {
                return rpc_err(id, EEXIST, "bdev exists");
            }
            s.bdevs.insert(
                name.clone(),
                FakeBdev {
                    pool: p["pool_name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    image: p["rbd_name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    uuid: p["uuid"].as_str().map(|v| v.to_string()),
                    size_mib: 0,
                },
            );
            rpc_ok(id, json!(name))
        }
        "bdev_rbd_delete" => {
            let name =
                p["name"].as_str().unwrap_or_default().to_string();
            if s.bdevs.remove(&name).is_none() {
                return rpc_err(id, ENOENT, "no bdev");
            }
            rpc_ok(id, json!(true))
        }
        "bdev_rbd_resize" => {
            let name =
                p["name"].as_str().unwrap_or_default().to_string();
            let new_size = p["new_size"].as_u64().unwrap_or_default();
            match s.bdevs.get_mut(&name) {
                Some(bdev) => {
                    if new_size < bdev.size_mib {
                        return rpc_err(id, -22, "shrink not supported");
                    }
                    bdev.size_mib = new_size;
                    rpc_ok(id, json!(true))
                }
                None => rpc_err(id, ENOENT, "no bdev"),
            }
        }
        "keyring_file_add_key" => {
            let name =
                p["name"].as_str().unwrap_or_default().to_string();
            let path =
                p["path"].as_str().unwrap_or_default().to_string();
            s.keyring.insert(name, path);
            rpc_ok(id, Value::Null)
        }
        "keyring_file_remove_key" => {
            let name =
                p["name"].as_str().unwrap_or_default().to_string();
            if s.keyring.remove(&name).is_none() {
                return rpc_err(id, ENOENT, "no key");
            }
            rpc_ok(id, Value::Null)
        }
        "log_set_level" | "log_set_print_level" => {
            s.log_level = p["level"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            rpc_ok(id, json!(true))
        }
        other => rpc_err(id, -32601, &format!("no method {}", other)),
    }
}

/// One gateway wired to a scripted engine and a shared state map.
pub struct TestGateway {
    pub ctx: Arc<GwContext>,
    pub tgt: FakeTgt,
    pub keyring_dir: tempfile::TempDir,
}

impl TestGateway {
    pub async fn new(name: &str, store: Arc<MemStore>) -> Self {
        let sock_dir = std::env::temp_dir();
        let unique = format!(
            "{}-{}",
            name,
            uuid::Uuid::new_v4().simple()
        );
        let fake = FakeTgt::spawn(&sock_dir, &unique);
        let keyring_dir = tempfile::tempdir().unwrap();

        let mut config = GwConfig::default();
        config.gateway.name = name.to_string();
        config.gateway.group = "group1".to_string();
        config.gateway.keyring_dir =
            keyring_dir.path().display().to_string();

        let tgt_client = Arc::new(fake.client());
        tgt_client.connect().await.unwrap();

        let state = Arc::new(StateMap::new(store, name));
        let keyring = Arc::new(Keyring::new(
            keyring_dir.path(),
            b"shared-group-secret",
        ));
        let ctx = Arc::new(GwContext {
            config: Arc::new(config),
            tgt: tgt_client,
            state,
            locks: Arc::new(SubsystemLocks::default()),
            keyring,
            ana: Arc::new(AnaGroups::default()),
            health: Arc::new(Health::default()),
            pending: Arc::new(PendingApplies::default()),
        });
        Self {
            ctx,
            tgt: fake,
            keyring_dir,
        }
    }

    /// Start this gateway's reconciler: startup convergence plus the watch
    /// worker.
    pub async fn start_reconciler(&self) {
        let reconciler = Reconciler::new(self.ctx.clone());
        reconciler.startup().await.unwrap();
        let watch = self.ctx.state.watch();
        let worker = Reconciler::new(self.ctx.clone());
        tokio::spawn(async move { worker.run(watch).await });
    }

    /// Give the watch workers a moment to drain.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}
