mod common;

use common::{test_config, wait_for, MockConnector, MockRadio};
use meshgate::config::Config;
use meshgate::gateway::Gateway;

fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.device = test_config();
    config.storage.data_dir = dir.display().to_string();
    config
}

#[tokio::test]
async fn gateway_wires_storage_and_manager() {
    let dir = tempfile::tempdir().unwrap();
    let radio = MockRadio::new();
    let gateway = Gateway::with_connector(config_in(dir.path()), MockConnector::new(radio.clone()))
        .unwrap();

    gateway.manager().start();
    assert!(wait_for(|| gateway.manager().is_connected()).await);

    let report = gateway.status_report().unwrap();
    assert_eq!(report["connection"]["state"], "connected");
    assert_eq!(report["device"]["name"], "Base Camp");
    assert!(dir.path().join("meshgate.db").exists());

    gateway.shutdown().await;
    assert!(!gateway.manager().is_connected());
}

#[tokio::test]
async fn second_gateway_on_same_data_dir_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let first = Gateway::with_connector(
        config_in(dir.path()),
        MockConnector::new(MockRadio::new()),
    )
    .unwrap();

    let second = Gateway::with_connector(
        config_in(dir.path()),
        MockConnector::new(MockRadio::new()),
    );
    let err = second.err().unwrap().to_string();
    assert!(err.contains("in use"), "{}", err);
    drop(first);
}
