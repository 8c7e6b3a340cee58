//! DeviceManager: owns the canonical set of Devices and bridges discovery
//! to their lifecycle.
//!
//! Each active Device runs on its own spawned task with a single-consumer
//! command queue. An idle Device lives directly in the manager's map;
//! activating it hands the `Device` to a task and leaves behind a command
//! sender, satisfying "is_active iff channel present."

use std::collections::HashMap;
use std::path::PathBuf;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::DeviceCache;
use crate::config::Config;
use crate::device::{ConnState, Device, DeviceEvent};
use crate::discovery::DiscoveredDevice;
use crate::error::{CoreError, Result};
use crate::identity::LocalCertificate;
use crate::packet::Packet;
use crate::transport::DeviceChannel;

/// Commands a live session accepts on its single-consumer queue.
pub enum DeviceCommand {
    Send(Packet),
    RequestPair,
    RejectPair,
    Unpair,
    UpdateFromDiscovery(DiscoveredDevice),
    Deactivate,
}

/// Something the manager's caller should observe: a device appearing for
/// the first time, or an event from a live session.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    DeviceAdded(String),
    Device(String, DeviceEvent),
}

enum DeviceSlot {
    Idle(Device),
    Active {
        command_tx: mpsc::UnboundedSender<DeviceCommand>,
        join_handle: JoinHandle<Device>,
    },
}

/// Owns every known Device and reconciles discovery against the cache.
pub struct DeviceManager {
    devices: HashMap<String, DeviceSlot>,
    cache_path: PathBuf,
    local_cert: LocalCertificate,
    local_identity: Packet,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    pub events: mpsc::UnboundedReceiver<ManagerEvent>,
}

impl DeviceManager {
    /// Load the DeviceCache from `config.cache_path` (tolerating a
    /// missing file) and construct one inactive Device per entry.
    pub fn new(config: &Config, local_cert: LocalCertificate) -> Result<Self> {
        let cache = DeviceCache::load(&config.cache_path)?;

        let device_id = config.device_id.clone().unwrap_or_else(|| local_cert.device_id.clone());
        let local_identity = Packet::identity(
            &device_id,
            &config.device_name,
            DiscoveredDevice::DEFAULT_PROTOCOL_VERSION,
            config.tcp_port,
            &config.device_type,
            &[],
            &[],
        );

        let mut devices = HashMap::new();
        for entry in cache.iter() {
            match Device::from_cache_entry(entry) {
                Ok(device) => {
                    devices.insert(entry.device_id.clone(), DeviceSlot::Idle(device));
                }
                Err(e) => warn!(device_id = %entry.device_id, error = %e, "dropping unloadable cache entry"),
            }
        }

        let (event_tx, events) = mpsc::unbounded_channel();

        Ok(Self {
            devices,
            cache_path: config.cache_path.clone(),
            local_cert,
            local_identity,
            event_tx,
            events,
        })
    }

    /// Apply a discovery observation: update the existing Device, or
    /// create a new one with `allowed = false` and persist it.
    pub fn handle_discovered(&mut self, discovered: DiscoveredDevice) -> Result<()> {
        let device_id = discovered.device_id.clone();

        match self.devices.get_mut(&device_id) {
            Some(DeviceSlot::Idle(device)) => {
                let (host_changed, events) = device.update_from_device(discovered);
                for event in events {
                    let _ = self.event_tx.send(ManagerEvent::Device(device_id.clone(), event));
                }
                if host_changed {
                    debug!(device_id = %device_id, "host changed while idle, nothing to deactivate");
                }
            }
            Some(DeviceSlot::Active { command_tx, .. }) => {
                let _ = command_tx.send(DeviceCommand::UpdateFromDiscovery(discovered));
            }
            None => {
                info!(device_id = %device_id, "new device discovered");
                let device = Device::from_discovery(discovered);
                self.persist(&device)?;
                self.devices.insert(device_id.clone(), DeviceSlot::Idle(device));
                let _ = self.event_tx.send(ManagerEvent::DeviceAdded(device_id));
            }
        }

        Ok(())
    }

    /// Flip a device's `allowed` flag. Flipping to `true` immediately
    /// activates it.
    pub async fn set_allowed(&mut self, device_id: &str, allowed: bool) -> Result<()> {
        if let Some(DeviceSlot::Idle(device)) = self.devices.get_mut(device_id) {
            device.allowed = allowed;
        }
        if let Some(DeviceSlot::Idle(device)) = self.devices.get(device_id) {
            self.persist(device)?;
        }
        if allowed {
            self.activate(device_id).await?;
        }
        Ok(())
    }

    /// Idle --activate()--> spawn the device's session task.
    pub async fn activate(&mut self, device_id: &str) -> Result<()> {
        let device = match self.devices.remove(device_id) {
            Some(DeviceSlot::Idle(device)) => device,
            Some(active @ DeviceSlot::Active { .. }) => {
                self.devices.insert(device_id.to_string(), active);
                return Ok(());
            }
            None => return Err(CoreError::DeviceNotFound(device_id.to_string())),
        };

        if !device.allowed {
            self.devices.insert(device_id.to_string(), DeviceSlot::Idle(device));
            return Err(CoreError::Configuration(format!(
                "device {device_id} is not allowed to connect"
            )));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let session = DeviceSession {
            device,
            channel: None,
            command_rx,
            event_tx: self.event_tx.clone(),
            local_cert: self.local_cert.clone(),
            local_identity: self.local_identity.clone(),
        };

        let join_handle = tokio::spawn(session.run());
        self.devices.insert(
            device_id.to_string(),
            DeviceSlot::Active {
                command_tx,
                join_handle,
            },
        );
        Ok(())
    }

    /// Any --deactivate()--> close the channel and reclaim the Device.
    pub async fn deactivate(&mut self, device_id: &str) -> Result<()> {
        let slot = self
            .devices
            .remove(device_id)
            .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))?;

        match slot {
            DeviceSlot::Idle(device) => {
                self.devices.insert(device_id.to_string(), DeviceSlot::Idle(device));
            }
            DeviceSlot::Active {
                command_tx,
                join_handle,
            } => {
                let _ = command_tx.send(DeviceCommand::Deactivate);
                let device = join_handle.await.unwrap_or_else(|_| {
                    panic!("device session for {device_id} panicked")
                });
                self.devices.insert(device_id.to_string(), DeviceSlot::Idle(device));
            }
        }
        Ok(())
    }

    /// Deactivate every active device and flush the cache.
    pub async fn shutdown(&mut self) -> Result<()> {
        let active_ids: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, slot)| matches!(slot, DeviceSlot::Active { .. }))
            .map(|(id, _)| id.clone())
            .collect();

        for id in active_ids {
            self.deactivate(&id).await?;
        }

        self.flush_cache()
    }

    /// Send a command to a live session's queue.
    pub fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<()> {
        match self.devices.get(device_id) {
            Some(DeviceSlot::Active { command_tx, .. }) => command_tx
                .send(command)
                .map_err(|_| CoreError::ChannelClosed(device_id.to_string())),
            Some(DeviceSlot::Idle(_)) => Err(CoreError::Configuration(format!(
                "device {device_id} is not active"
            ))),
            None => Err(CoreError::DeviceNotFound(device_id.to_string())),
        }
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        matches!(self.devices.get(device_id), Some(DeviceSlot::Active { .. }))
    }

    pub fn conn_state(&self, device_id: &str) -> Option<ConnState> {
        match self.devices.get(device_id) {
            Some(DeviceSlot::Idle(device)) => Some(device.conn_state()),
            _ => None,
        }
    }

    fn persist(&self, device: &Device) -> Result<()> {
        let mut cache = DeviceCache::load(&self.cache_path)?;
        cache.insert(device.to_cache_entry());
        cache.save(&self.cache_path)
    }

    fn flush_cache(&self) -> Result<()> {
        let mut cache = DeviceCache::load(&self.cache_path)?;
        for slot in self.devices.values() {
            if let DeviceSlot::Idle(device) = slot {
                cache.insert(device.to_cache_entry());
            }
        }
        cache.save(&self.cache_path)
    }
}

/// The async driver for one activated Device: owns the channel, the
/// command queue, and the pair timer.
struct DeviceSession {
    device: Device,
    channel: Option<DeviceChannel>,
    command_rx: mpsc::UnboundedReceiver<DeviceCommand>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    local_cert: LocalCertificate,
    local_identity: Packet,
}

impl DeviceSession {
    async fn run(mut self) -> Device {
        if let Err(e) = self.connect().await {
            warn!(device_id = %self.device.device_id, error = %e, "activation failed");
            let event = self.device.mark_channel_open_failed();
            self.emit(event);
            return self.device;
        }

        loop {
            // Poll on a short tick rather than sleeping the full timeout so
            // a pair packet that arrives just after the deadline still
            // wins the race per Device::pair_timeout's re-check.
            let pair_in_progress = self.device.pair_in_progress;
            let pair_wait = async move {
                if pair_in_progress {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                } else {
                    std::future::pending::<()>().await
                }
            };

            let channel = match self.channel.as_mut() {
                Some(channel) => channel,
                None => break,
            };

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(DeviceCommand::Deactivate) | None => {
                            self.device.mark_disconnecting();
                            break;
                        }
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                    }
                }
                received = channel.receive() => {
                    match received {
                        Ok(packet) => {
                            let (reply, events) = self.device.handle_message(packet);
                            for event in events {
                                self.emit(event);
                            }
                            if let Some(reply) = reply {
                                if let Err(e) = channel.send(&reply).await {
                                    warn!(device_id = %self.device.device_id, error = %e, "pair acknowledgement send failed");
                                }
                            }
                        }
                        Err(e) => {
                            debug!(device_id = %self.device.device_id, error = %e, "channel closed");
                            break;
                        }
                    }
                }
                _ = pair_wait => {
                    if let Some(event) = self.device.pair_timeout() {
                        self.emit(event);
                    }
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        let event = self.device.mark_disconnected();
        self.emit(event);
        self.device
    }

    async fn connect(&mut self) -> Result<()> {
        let host = self
            .device
            .host
            .ok_or_else(|| CoreError::NetworkUnreachable("no known host for device".to_string()))?;

        self.device.mark_connecting();
        let (channel, _peer_identity) = DeviceChannel::open(
            host,
            self.device.tcp_port,
            &self.local_identity,
            Some(&self.device.device_id),
        )
        .await?;
        self.device.mark_identity_sent();

        self.device.mark_securing();
        let expected_cert_der = match &self.device.certificate {
            Some(cert) => Some(cert.to_der().map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?),
            None => None,
        };

        match channel
            .secure(&self.local_cert, expected_cert_der.as_deref())
            .await
        {
            Ok((secured, peer_cert)) => {
                self.channel = Some(secured);
                let event = self.device.mark_secured(peer_cert)?;
                self.emit(event);
                Ok(())
            }
            Err(e) => {
                self.device.mark_tls_failed();
                Err(e)
            }
        }
    }

    /// Returns `true` if the session should stop after handling this
    /// command (a host change invalidates the open channel).
    async fn handle_command(&mut self, command: DeviceCommand) -> bool {
        if let DeviceCommand::UpdateFromDiscovery(discovered) = command {
            let (host_changed, events) = self.device.update_from_device(discovered);
            for event in events {
                self.emit(event);
            }
            if host_changed {
                debug!(device_id = %self.device.device_id, "host changed, tearing down live session");
                self.device.mark_disconnecting();
                return true;
            }
            return false;
        }

        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return false,
        };

        match command {
            DeviceCommand::Send(packet) => {
                if let Err(e) = channel.send(&packet).await {
                    warn!(device_id = %self.device.device_id, error = %e, "send failed");
                }
            }
            DeviceCommand::RequestPair => {
                let packet = self.device.start_pair(true);
                if let Err(e) = channel.send(&packet).await {
                    warn!(device_id = %self.device.device_id, error = %e, "pair request send failed");
                }
            }
            DeviceCommand::RejectPair => {
                let packet = Packet::pair(false);
                let _ = channel.send(&packet).await;
                let (_, event) = self.device.handle_pair_packet(false);
                self.emit(event);
            }
            DeviceCommand::Unpair => {
                let packet = Packet::pair(false);
                let _ = channel.send(&packet).await;
                let (_, event) = self.device.handle_pair_packet(false);
                self.emit(event);
            }
            DeviceCommand::UpdateFromDiscovery(_) | DeviceCommand::Deactivate => {}
        }
        false
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self
            .event_tx
            .send(ManagerEvent::Device(self.device.device_id.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    use crate::discovery::DeviceType;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            device_name: "Test Desktop".to_string(),
            device_type: "desktop".to_string(),
            device_id: Some("local-device".to_string()),
            tcp_port: 1714,
            pair_timeout_secs: 30,
            cert_dir: dir.join("certs"),
            cache_path: dir.join("devices.toml"),
        }
    }

    #[tokio::test]
    async fn discovering_a_new_device_emits_device_added() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let cert = LocalCertificate::generate("local-device").unwrap();
        let mut manager = DeviceManager::new(&config, cert).unwrap();

        manager
            .handle_discovered(DiscoveredDevice {
                device_id: "peer-1".to_string(),
                device_name: "Peer Phone".to_string(),
                device_type: DeviceType::Phone,
                protocol_version: 7,
                tcp_port: 1714,
                host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
                outgoing_capabilities: Default::default(),
                incoming_capabilities: Default::default(),
            })
            .unwrap();

        let event = manager.events.recv().await.unwrap();
        assert!(matches!(event, ManagerEvent::DeviceAdded(id) if id == "peer-1"));
    }

    #[tokio::test]
    async fn activating_a_disallowed_device_fails() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let cert = LocalCertificate::generate("local-device").unwrap();
        let mut manager = DeviceManager::new(&config, cert).unwrap();

        manager
            .handle_discovered(DiscoveredDevice {
                device_id: "peer-1".to_string(),
                device_name: "Peer Phone".to_string(),
                device_type: DeviceType::Phone,
                protocol_version: 7,
                tcp_port: 1714,
                host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
                outgoing_capabilities: Default::default(),
                incoming_capabilities: Default::default(),
            })
            .unwrap();
        let _ = manager.events.recv().await;

        let result = manager.activate("peer-1").await;
        assert!(result.is_err());
    }
}
