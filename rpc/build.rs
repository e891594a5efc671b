extern crate tonic_build;

fn main() {
    // admin API served by the gateway
    tonic_build::configure()
        .build_server(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile(&["proto/gateway.proto"], &["proto"])
        .unwrap_or_else(|e| {
            panic!("gateway protobuf compilation failed: {}", e)
        });

    // registration and ANA assignment feed of the cluster monitor
    tonic_build::configure()
        .build_server(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile(&["proto/monitor.proto"], &["proto"])
        .unwrap_or_else(|e| {
            panic!("monitor protobuf compilation failed: {}", e)
        });
}
