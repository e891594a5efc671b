//! End to end tests of the gateway service operations against a scripted
//! engine and a shared in-memory state map. Multi-gateway behavior is
//! exercised by wiring two gateway contexts to the same map.

mod common;

use common::TestGateway;
use nvmeof_gw::{
    error::SvcError,
    keyring::KeySecret,
    service::{connection, host, listener, namespace, subsystem},
    state::records::AddressFamily,
    store::{mem::MemStore, store_defs::StateStore},
};
use assert_matches::assert_matches;
use std::sync::Arc;

const NQN: &str = "nqn.2016-06.io.spdk:cnode1";
const HOST1: &str = "nqn.2014-08.org.nvmexpress:uuid:host1";
const HOST2: &str = "nqn.2014-08.org.nvmexpress:uuid:host2";
const PSK: &str = "NVMeTLSkey-1:01:YWJjZGVmZ2hpamtsbW5vcDEyMzQ1Njc4OQ==:";

fn sub_args(nqn: &str) -> subsystem::SubsystemAddArgs {
    subsystem::SubsystemAddArgs {
        nqn: nqn.to_string(),
        serial: None,
        max_namespaces: None,
        no_group_append: true,
    }
}

fn ns_args(nqn: &str, image: &str) -> namespace::NamespaceAddArgs {
    namespace::NamespaceAddArgs {
        nqn: nqn.to_string(),
        nsid: None,
        pool: "rbd".to_string(),
        image: image.to_string(),
        size: Some(10 * 1024 * 1024),
        block_size: None,
        uuid: None,
        anagrpid: None,
        auto_visible: true,
    }
}

fn listener_args(nqn: &str, gw: &str, port: u16) -> listener::ListenerArgs {
    listener::ListenerArgs {
        nqn: nqn.to_string(),
        gateway: gw.to_string(),
        transport: "tcp".to_string(),
        adrfam: AddressFamily::Ipv4,
        traddr: "192.168.13.3".to_string(),
        trsvcid: port,
        secure: false,
    }
}

fn wildcard(nqn: &str) -> host::HostAddArgs {
    host::HostAddArgs {
        nqn: nqn.to_string(),
        host_nqn: "*".to_string(),
        psk: None,
        dhchap: None,
        dhchap_ctrlr: None,
    }
}

fn psk_host(nqn: &str, host_nqn: &str) -> host::HostAddArgs {
    host::HostAddArgs {
        nqn: nqn.to_string(),
        host_nqn: host_nqn.to_string(),
        psk: Some(KeySecret::new(PSK)),
        dhchap: None,
        dhchap_ctrlr: None,
    }
}

#[tokio::test]
async fn config_propagates_to_peer_gateway() {
    let store = Arc::new(MemStore::new());
    let gw1 = TestGateway::new("gw-1", store.clone()).await;
    let gw2 = TestGateway::new("gw-2", store.clone()).await;
    gw1.start_reconciler().await;
    gw2.start_reconciler().await;

    subsystem::add(&gw1.ctx, sub_args(NQN)).await.unwrap();
    let ns = namespace::add(&gw1.ctx, ns_args(NQN, "demo_image"))
        .await
        .unwrap();
    assert_eq!(ns.nsid, 1);
    listener::add(&gw1.ctx, listener_args(NQN, "gw-1", 4420))
        .await
        .unwrap();
    host::add(&gw1.ctx, wildcard(NQN)).await.unwrap();
    TestGateway::settle().await;

    // the peer serves the same cluster view from the state map
    let views = subsystem::list(&gw2.ctx).await.unwrap();
    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.subsystem.nqn, NQN);
    assert!(view.subsystem.allow_any_host);
    assert_eq!(view.namespaces.len(), 1);
    assert_eq!(view.namespaces[0].nsid, 1);
    assert_eq!(view.listeners.len(), 1);
    assert_eq!(view.listeners[0].traddr, "192.168.13.3");
    assert_eq!(view.listeners[0].trsvcid, 4420);

    // the peer's engine mirrors the subsystem but not the foreign listener
    let peer_engine = gw2.tgt.state.lock();
    let sub = peer_engine.subsystems.get(NQN).expect("peer converged");
    assert!(sub.allow_any_host);
    assert_eq!(sub.namespaces.len(), 1);
    assert!(sub.namespaces.contains_key(&1));
    assert!(sub.listeners.is_empty());

    // the owner's engine realized the listener
    let own_engine = gw1.tgt.state.lock();
    assert_eq!(own_engine.subsystems[NQN].listeners.len(), 1);
}

#[tokio::test]
async fn subsystem_add_twice_is_already_exists() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    let err = subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap_err();
    assert_matches!(err, SvcError::SubsystemExists { .. });

    // no partial mutation: exactly one subsystem everywhere
    assert_eq!(subsystem::list(&gw.ctx).await.unwrap().len(), 1);
    assert_eq!(gw.tgt.state.lock().subsystems.len(), 1);
}

#[tokio::test]
async fn explicit_nsid_collision_is_deterministic() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    let mut args = ns_args(NQN, "img1");
    args.nsid = Some(3);
    namespace::add(&gw.ctx, args).await.unwrap();

    let mut clash = ns_args(NQN, "img2");
    clash.nsid = Some(3);
    let err = namespace::add(&gw.ctx, clash).await.unwrap_err();
    assert_matches!(err, SvcError::NamespaceExists { nsid: 3, .. });

    // unspecified nsid takes the lowest free slot
    let ns = namespace::add(&gw.ctx, ns_args(NQN, "img3")).await.unwrap();
    assert_eq!(ns.nsid, 1);
}

#[tokio::test]
async fn namespace_del_is_idempotent() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    namespace::add(&gw.ctx, ns_args(NQN, "img")).await.unwrap();
    namespace::del(&gw.ctx, NQN, 1).await.unwrap();
    namespace::del(&gw.ctx, NQN, 1).await.unwrap();

    let err = namespace::del(&gw.ctx, "nqn.2016-06.io.spdk:ghost", 1)
        .await
        .unwrap_err();
    assert_matches!(err, SvcError::SubsystemNotFound { .. });
}

#[tokio::test]
async fn namespace_resize_refuses_shrink() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    let ns = namespace::add(&gw.ctx, ns_args(NQN, "img")).await.unwrap();

    let err = namespace::resize(&gw.ctx, NQN, ns.nsid, 1024)
        .await
        .unwrap_err();
    assert_matches!(err, SvcError::InvalidArguments { .. });

    let grown =
        namespace::resize(&gw.ctx, NQN, ns.nsid, 20 * 1024 * 1024)
            .await
            .unwrap();
    // resize never renumbers
    assert_eq!(grown.nsid, ns.nsid);
    assert_eq!(grown.size, 20 * 1024 * 1024);
}

#[tokio::test]
async fn acl_styles_are_mutually_exclusive() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;
    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();

    host::add(&gw.ctx, wildcard(NQN)).await.unwrap();
    let err = host::add(&gw.ctx, psk_host(NQN, HOST1)).await.unwrap_err();
    assert_matches!(err, SvcError::AclModeConflict { .. });

    host::del(&gw.ctx, NQN, "*").await.unwrap();
    host::add(&gw.ctx, psk_host(NQN, HOST1)).await.unwrap();
    let err = host::add(&gw.ctx, wildcard(NQN)).await.unwrap_err();
    assert_matches!(err, SvcError::AclModeConflict { .. });
}

#[tokio::test]
async fn listener_with_foreign_gateway_name_is_rejected() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;
    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();

    let err = listener::add(&gw.ctx, listener_args(NQN, "gw-9", 4420))
        .await
        .unwrap_err();
    assert_matches!(err, SvcError::WrongGateway { .. });

    // deleting a listener that was never realized is a no-op
    listener::del(&gw.ctx, listener_args(NQN, "gw-1", 4421))
        .await
        .unwrap();
}

#[tokio::test]
async fn non_force_delete_requires_empty_subsystem() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    namespace::add(&gw.ctx, ns_args(NQN, "img")).await.unwrap();
    let err = subsystem::del(&gw.ctx, NQN, false).await.unwrap_err();
    assert_matches!(err, SvcError::SubsystemNotEmpty { .. });

    namespace::del(&gw.ctx, NQN, 1).await.unwrap();
    // a sole wildcard host counts as an empty ACL
    host::add(&gw.ctx, wildcard(NQN)).await.unwrap();
    subsystem::del(&gw.ctx, NQN, false).await.unwrap();
    assert!(subsystem::list(&gw.ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn force_delete_leaves_no_trace() {
    let store = Arc::new(MemStore::new());
    let gw1 = TestGateway::new("gw-1", store.clone()).await;
    let gw2 = TestGateway::new("gw-2", store.clone()).await;
    gw1.start_reconciler().await;
    gw2.start_reconciler().await;

    subsystem::add(&gw1.ctx, sub_args(NQN)).await.unwrap();
    namespace::add(&gw1.ctx, ns_args(NQN, "img")).await.unwrap();
    host::add(&gw1.ctx, psk_host(NQN, HOST1)).await.unwrap();
    host::add(&gw1.ctx, psk_host(NQN, HOST2)).await.unwrap();
    TestGateway::settle().await;

    // peers installed the replicated keys
    assert!(!gw2.tgt.state.lock().keyring.is_empty());

    subsystem::del(&gw1.ctx, NQN, true).await.unwrap();
    TestGateway::settle().await;

    let snapshot = store.snapshot().await.unwrap();
    for prefix in ["sub/", "ns/", "hst/", "key/"] {
        assert_eq!(
            snapshot.with_prefix(prefix).count(),
            0,
            "leftover {} records",
            prefix
        );
    }
    for gw in [&gw1, &gw2] {
        let engine = gw.tgt.state.lock();
        assert!(engine.subsystems.is_empty());
        assert!(engine.keyring.is_empty(), "engine keyring not revoked");
        assert!(engine.bdevs.is_empty());
    }
    // no key file of any kind survives on disk
    for dir in [&gw1.keyring_dir, &gw2.keyring_dir] {
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "key files left behind"
        );
    }
}

#[tokio::test]
async fn connection_list_reports_connected_and_absent_hosts() {
    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;

    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    listener::add(&gw.ctx, listener_args(NQN, "gw-1", 4420))
        .await
        .unwrap();
    host::add(&gw.ctx, psk_host(NQN, HOST1)).await.unwrap();
    host::add(
        &gw.ctx,
        host::HostAddArgs {
            nqn: NQN.to_string(),
            host_nqn: HOST2.to_string(),
            psk: None,
            dhchap: None,
            dhchap_ctrlr: None,
        },
    )
    .await
    .unwrap();
    gw.tgt.connect_controller(NQN, HOST1, 7, 4);

    let mut rows = connection::list(&gw.ctx, NQN).await.unwrap();
    rows.sort_by(|a, b| a.host_nqn.cmp(&b.host_nqn));
    assert_eq!(rows.len(), 2);

    let connected = &rows[0];
    assert_eq!(connected.host_nqn, HOST1);
    assert!(connected.connected);
    assert!(connected.use_psk);
    assert!(connected.secure);
    assert_eq!(connected.qpairs, 4);
    assert_eq!(connected.controller_id, 7);
    assert_eq!(connected.traddr, "192.168.13.3");

    let absent = &rows[1];
    assert_eq!(absent.host_nqn, HOST2);
    assert!(!absent.connected);
    assert!(!absent.use_psk);
}

#[tokio::test]
async fn concurrent_namespace_churn_converges() {
    let store = Arc::new(MemStore::new());
    let gw1 = TestGateway::new("gw-1", store.clone()).await;
    let gw2 = TestGateway::new("gw-2", store.clone()).await;
    gw1.start_reconciler().await;
    gw2.start_reconciler().await;

    subsystem::add(&gw1.ctx, sub_args(NQN)).await.unwrap();
    TestGateway::settle().await;

    let total: u32 = 20;
    let ctx1 = gw1.ctx.clone();
    let ctx2 = gw2.ctx.clone();
    let adds1 = tokio::spawn(async move {
        for nsid in (1 ..= total).step_by(2) {
            let mut args = ns_args(NQN, &format!("img{}", nsid));
            args.nsid = Some(nsid);
            args.anagrpid = Some(1);
            namespace::add(&ctx1, args).await.unwrap();
        }
    });
    let adds2 = tokio::spawn(async move {
        for nsid in (2 ..= total).step_by(2) {
            let mut args = ns_args(NQN, &format!("img{}", nsid));
            args.nsid = Some(nsid);
            args.anagrpid = Some(2);
            namespace::add(&ctx2, args).await.unwrap();
        }
    });
    adds1.await.unwrap();
    adds2.await.unwrap();
    TestGateway::settle().await;

    for gw in [&gw1, &gw2] {
        assert_eq!(
            gw.tgt.state.lock().subsystems[NQN].namespaces.len(),
            total as usize
        );
    }

    for nsid in 1 ..= total / 2 {
        namespace::del(&gw1.ctx, NQN, nsid).await.unwrap();
    }
    TestGateway::settle().await;
    for gw in [&gw1, &gw2] {
        assert_eq!(
            gw.tgt.state.lock().subsystems[NQN].namespaces.len(),
            (total / 2) as usize
        );
    }

    for nsid in total / 2 + 1 ..= total {
        namespace::del(&gw2.ctx, NQN, nsid).await.unwrap();
    }
    TestGateway::settle().await;
    for gw in [&gw1, &gw2] {
        assert!(gw.tgt.state.lock().subsystems[NQN].namespaces.is_empty());
    }
}

#[tokio::test]
async fn key_bytes_never_reach_logs_or_engine_parameters() {
    use std::io::Write as _;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
        type Writer = Capture;
        fn make_writer(&'a self) -> Capture {
            self.clone()
        }
    }

    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(capture.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store.clone()).await;
    gw.start_reconciler().await;
    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    host::add(&gw.ctx, psk_host(NQN, HOST1)).await.unwrap();
    host::del(&gw.ctx, NQN, HOST1).await.unwrap();
    TestGateway::settle().await;

    // the raw key must appear nowhere in the log stream at any level
    let secret_body = "YWJjZGVmZ2hpamtsbW5vcDEyMzQ1Njc4OQ";
    let logs = String::from_utf8_lossy(&capture.0.lock().unwrap()).to_string();
    assert!(
        !logs.contains(secret_body),
        "key bytes leaked into the logs"
    );

    // nor in any state map record, nor in any engine rpc parameter
    let snapshot = store.snapshot().await.unwrap();
    for (key, record) in &snapshot.entries {
        assert!(
            !record.payload.to_string().contains(secret_body),
            "plaintext key in record {}",
            key
        );
    }
    for (method, params) in &gw.tgt.state.lock().transcript {
        assert!(
            !params.to_string().contains(secret_body),
            "plaintext key in engine call {}",
            method
        );
    }
}

#[tokio::test]
async fn key_files_are_created_0600_and_removed_with_host() {
    use std::os::unix::fs::PermissionsExt;

    let store = Arc::new(MemStore::new());
    let gw = TestGateway::new("gw-1", store).await;
    gw.start_reconciler().await;
    subsystem::add(&gw.ctx, sub_args(NQN)).await.unwrap();
    host::add(&gw.ctx, psk_host(NQN, HOST1)).await.unwrap();

    let psk_dir = gw
        .keyring_dir
        .path()
        .join(format!("psk_{}", NQN));
    let files: Vec<_> = std::fs::read_dir(&psk_dir)
        .expect("psk dir exists")
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let mode = std::fs::metadata(&files[0])
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
    // the engine references the file through its keyring
    assert!(!gw.tgt.state.lock().keyring.is_empty());

    host::del(&gw.ctx, NQN, HOST1).await.unwrap();
    assert!(!psk_dir.exists(), "empty key directory must be removed");
    assert!(gw.tgt.state.lock().keyring.is_empty());
}
