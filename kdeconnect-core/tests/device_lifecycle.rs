//! End-to-end lifecycle tests driving `DeviceManager` the way a daemon
//! would: discovery observations in, manager events out.

use std::net::{IpAddr, Ipv4Addr};

use kdeconnect_core::{Config, DeviceType, DiscoveredDevice, LocalCertificate};
use kdeconnect_core::manager::{DeviceManager, ManagerEvent};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        device_name: "Test Desktop".to_string(),
        device_type: "desktop".to_string(),
        device_id: Some("local-device".to_string()),
        tcp_port: 1714,
        pair_timeout_secs: 30,
        cert_dir: dir.path().join("certs"),
        cache_path: dir.path().join("devices.toml"),
    }
}

fn phone(device_id: &str, ip: [u8; 4]) -> DiscoveredDevice {
    DiscoveredDevice {
        device_id: device_id.to_string(),
        device_name: "Alice's Phone".to_string(),
        device_type: DeviceType::Phone,
        protocol_version: 7,
        tcp_port: 1716,
        host: IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
        outgoing_capabilities: ["kdeconnect.battery".to_string()].into_iter().collect(),
        incoming_capabilities: ["kdeconnect.ping".to_string()].into_iter().collect(),
    }
}

#[tokio::test]
async fn first_sighting_of_a_device_is_untrusted_by_default() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();
    let mut manager = DeviceManager::new(&config, cert).unwrap();

    manager
        .handle_discovered(phone("phone-1", [192, 168, 1, 20]))
        .unwrap();

    let event = manager.events.recv().await.unwrap();
    assert!(matches!(event, ManagerEvent::DeviceAdded(id) if id == "phone-1"));
    assert!(!manager.is_active("phone-1"));
}

#[tokio::test]
async fn activating_an_unknown_device_fails_with_device_not_found() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();
    let mut manager = DeviceManager::new(&config, cert).unwrap();

    let result = manager.activate("ghost").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn rediscovering_a_device_with_new_capabilities_updates_it_in_place() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();
    let mut manager = DeviceManager::new(&config, cert).unwrap();

    manager
        .handle_discovered(phone("phone-1", [192, 168, 1, 20]))
        .unwrap();
    let _ = manager.events.recv().await;

    let mut updated = phone("phone-1", [192, 168, 1, 20]);
    updated
        .outgoing_capabilities
        .insert("kdeconnect.sms".to_string());
    manager.handle_discovered(updated).unwrap();

    // Still a single idle entry, no second DeviceAdded fired.
    assert!(!manager.is_active("phone-1"));
}

#[tokio::test]
async fn deactivating_a_device_that_was_never_activated_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();
    let mut manager = DeviceManager::new(&config, cert).unwrap();

    manager
        .handle_discovered(phone("phone-1", [192, 168, 1, 20]))
        .unwrap();
    let _ = manager.events.recv().await;

    manager.deactivate("phone-1").await.unwrap();
    assert!(!manager.is_active("phone-1"));
}

#[tokio::test]
async fn shutdown_with_no_active_devices_still_flushes_the_cache() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();
    let mut manager = DeviceManager::new(&config, cert).unwrap();

    manager
        .handle_discovered(phone("phone-1", [192, 168, 1, 20]))
        .unwrap();
    let _ = manager.events.recv().await;

    manager.shutdown().await.unwrap();
    assert!(config.cache_path.exists());
}

#[tokio::test]
async fn restart_reloads_known_devices_from_cache() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cert = LocalCertificate::generate("local-device").unwrap();

    {
        let mut manager = DeviceManager::new(&config, cert.clone()).unwrap();
        manager
            .handle_discovered(phone("phone-1", [192, 168, 1, 20]))
            .unwrap();
        let _ = manager.events.recv().await;
        manager.shutdown().await.unwrap();
    }

    let manager = DeviceManager::new(&config, cert).unwrap();
    assert!(manager.conn_state("phone-1").is_some());
}
