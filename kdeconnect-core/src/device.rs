//! The per-peer state machine.
//!
//! `Device` is a pure in-memory actor: every method here is synchronous and
//! does no I/O. The channel lifecycle (opening sockets, the TLS upgrade,
//! arming the pair timer) is driven by `DeviceManager`'s per-device task
//! (see `manager.rs`), which calls these transition methods and forwards
//! the `DeviceEvent`s they return to subscribers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use openssl::x509::X509;
use tracing::{debug, info, warn};

use crate::cache::DeviceCacheEntry;
use crate::discovery::{DeviceType, DiscoveredDevice};
use crate::error::{CoreError, Result};
use crate::identity;
use crate::packet::Packet;

/// How long a pair request waits for a response before it times out.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    GreetingPlain,
    Securing,
    Ready,
    Disconnecting,
}

/// Pairing sub-state, orthogonal to `ConnState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    PairRequested,
    Paired,
    Rejected,
}

/// Events a Device emits as a side effect of a transition. The caller
/// (DeviceManager's per-device task) forwards these to subscribers and to
/// registered capability handlers.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Paired(bool),
    Message(Packet),
    CapabilityAdded(String),
    CapabilityRemoved(String),
}

/// A handler claims one or more capabilities and receives packets for
/// them. Device holds no owning reference back to anything the handler
/// depends on; `release_device` is the handler's cue to drop whatever it
/// subscribed.
pub trait CapabilityHandler: Send {
    fn packet_type_filter(&self) -> &str;
    fn use_device(&mut self, device_id: &str);
    fn release_device(&mut self, device_id: &str);
}

/// Per-peer entity: identity, trust, activity, capabilities and handlers.
pub struct Device {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub tcp_port: u16,
    pub host: Option<IpAddr>,

    pub certificate: Option<X509>,
    pub certificate_fingerprint: String,
    pub is_paired: bool,
    pub allowed: bool,

    pub is_active: bool,
    pub pair_in_progress: bool,
    pair_deadline: Option<Instant>,

    pub outgoing_capabilities: HashSet<String>,
    pub incoming_capabilities: HashSet<String>,
    effective_capabilities: HashSet<String>,

    handlers: std::collections::HashMap<String, Box<dyn CapabilityHandler>>,

    conn_state: ConnState,
    pair_state: PairState,
}

impl Device {
    /// Construct a fresh Device from a discovery observation. Newly
    /// discovered devices default to `allowed = false` until the user
    /// explicitly trusts them.
    pub fn from_discovery(discovered: DiscoveredDevice) -> Self {
        let outgoing = discovered.outgoing_capabilities;
        let incoming = discovered.incoming_capabilities;
        let effective: HashSet<String> = outgoing.union(&incoming).cloned().collect();

        Self {
            device_id: discovered.device_id,
            device_name: discovered.device_name,
            device_type: discovered.device_type,
            protocol_version: discovered.protocol_version,
            tcp_port: discovered.tcp_port,
            host: Some(discovered.host),
            certificate: None,
            certificate_fingerprint: String::new(),
            is_paired: false,
            allowed: false,
            is_active: false,
            pair_in_progress: false,
            pair_deadline: None,
            outgoing_capabilities: outgoing,
            incoming_capabilities: incoming,
            effective_capabilities: effective,
            handlers: std::collections::HashMap::new(),
            conn_state: ConnState::Idle,
            pair_state: PairState::Unpaired,
        }
    }

    /// Reconstruct a Device from a persisted cache entry at startup. No
    /// host is set yet; the device is reachable only after a fresh
    /// discovery observation supplies one.
    pub fn from_cache_entry(entry: &DeviceCacheEntry) -> Result<Self> {
        let device_type = match entry.device_type.as_str() {
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "tv" => DeviceType::Tv,
            other => {
                return Err(CoreError::CacheLoadError {
                    group: entry.device_id.clone(),
                    reason: format!("unknown deviceType '{other}'"),
                })
            }
        };

        let certificate = if entry.certificate.is_empty() {
            None
        } else {
            Some(identity::parse_pem(&entry.certificate)?)
        };
        let certificate_fingerprint = match &certificate {
            Some(cert) => identity::fingerprint(cert)?,
            None => String::new(),
        };

        let outgoing: HashSet<String> = entry.outgoing_capabilities.iter().cloned().collect();
        let incoming: HashSet<String> = entry.incoming_capabilities.iter().cloned().collect();
        let effective: HashSet<String> = outgoing.union(&incoming).cloned().collect();

        Ok(Self {
            device_id: entry.device_id.clone(),
            device_name: entry.device_name.clone(),
            device_type,
            protocol_version: entry.protocol_version,
            tcp_port: entry.tcp_port,
            host: entry.last_ip_address.parse().ok(),
            certificate,
            certificate_fingerprint,
            is_paired: entry.paired,
            allowed: entry.allowed,
            is_active: false,
            pair_in_progress: false,
            pair_deadline: None,
            outgoing_capabilities: outgoing,
            incoming_capabilities: incoming,
            effective_capabilities: effective,
            handlers: std::collections::HashMap::new(),
            conn_state: ConnState::Idle,
            pair_state: if entry.paired {
                PairState::Paired
            } else {
                PairState::Unpaired
            },
        })
    }

    /// Snapshot this Device's persisted fields for DeviceCache.
    pub fn to_cache_entry(&self) -> DeviceCacheEntry {
        DeviceCacheEntry {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type.as_str().to_string(),
            protocol_version: self.protocol_version,
            tcp_port: self.tcp_port,
            last_ip_address: self.host.map(|h| h.to_string()).unwrap_or_default(),
            allowed: self.allowed,
            paired: self.is_paired,
            certificate: self
                .certificate
                .as_ref()
                .and_then(|c| c.to_pem().ok())
                .map(|pem| String::from_utf8_lossy(&pem).into_owned())
                .unwrap_or_default(),
            outgoing_capabilities: self.outgoing_capabilities.iter().cloned().collect(),
            incoming_capabilities: self.incoming_capabilities.iter().cloned().collect(),
        }
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    pub fn pair_state(&self) -> PairState {
        self.pair_state
    }

    // ---- connection transitions ----

    /// Idle --activate()--> Connecting.
    pub fn mark_connecting(&mut self) {
        debug!(device_id = %self.device_id, "activating device");
        self.conn_state = ConnState::Connecting;
    }

    /// Connecting --channel opened OK--> GreetingPlain.
    pub fn mark_identity_sent(&mut self) {
        self.conn_state = ConnState::GreetingPlain;
    }

    /// GreetingPlain --identity sent--> Securing.
    pub fn mark_securing(&mut self) {
        self.conn_state = ConnState::Securing;
    }

    /// Connecting --channel open failed--> Idle.
    pub fn mark_channel_open_failed(&mut self) -> DeviceEvent {
        warn!(device_id = %self.device_id, "channel failed to open");
        self.conn_state = ConnState::Idle;
        self.is_active = false;
        DeviceEvent::Disconnected
    }

    /// Securing --TLS success--> Ready. Stores the peer certificate and
    /// recomputes the fingerprint.
    pub fn mark_secured(&mut self, peer_cert: X509) -> Result<DeviceEvent> {
        self.update_certificate(peer_cert)?;
        self.conn_state = ConnState::Ready;
        self.is_active = true;
        info!(device_id = %self.device_id, "connected and secured");
        Ok(DeviceEvent::Connected)
    }

    /// Securing --TLS failure--> Disconnecting.
    pub fn mark_tls_failed(&mut self) {
        warn!(device_id = %self.device_id, "TLS upgrade failed");
        self.conn_state = ConnState::Disconnecting;
    }

    /// Ready --channel disconnected--> Idle, or Any --deactivate()--> Idle
    /// once the channel has actually closed.
    pub fn mark_disconnected(&mut self) -> DeviceEvent {
        info!(device_id = %self.device_id, "disconnected");
        self.conn_state = ConnState::Idle;
        self.is_active = false;
        self.cancel_pair_timer();
        DeviceEvent::Disconnected
    }

    /// Any --deactivate()--> Disconnecting.
    pub fn mark_disconnecting(&mut self) {
        self.conn_state = ConnState::Disconnecting;
    }

    // ---- certificate update ----

    pub fn update_certificate(&mut self, cert: X509) -> Result<()> {
        self.certificate_fingerprint = identity::fingerprint(&cert)?;
        self.certificate = Some(cert);
        Ok(())
    }

    // ---- pairing protocol ----

    /// Send a pair request. If `expect_response`, arm the 30-second
    /// timer; an already-armed timer is never duplicated (the Device
    /// invariant forbids two outstanding pair timers).
    pub fn start_pair(&mut self, expect_response: bool) -> Packet {
        if expect_response && !self.pair_in_progress {
            self.pair_in_progress = true;
            self.pair_deadline = Some(Instant::now() + PAIR_TIMEOUT);
            self.pair_state = PairState::PairRequested;
        }
        Packet::pair(true)
    }

    /// Handle an inbound `kdeconnect.pair` packet: a response to our own
    /// outstanding request, an unsolicited request from the peer, or an
    /// unpair notification.
    pub fn handle_pair_packet(&mut self, pair: bool) -> (Option<Packet>, DeviceEvent) {
        if self.pair_in_progress {
            self.cancel_pair_timer();
            self.is_paired = pair;
            self.pair_state = if pair {
                PairState::Paired
            } else {
                PairState::Rejected
            };
            return (None, DeviceEvent::Paired(pair));
        }

        if pair {
            // Unsolicited peer-initiated pair request: adopt and
            // acknowledge without arming a timer of our own.
            self.is_paired = true;
            self.pair_state = PairState::Paired;
            (Some(Packet::pair(true)), DeviceEvent::Paired(true))
        } else {
            // The remote unpaired us.
            self.is_paired = false;
            self.pair_state = PairState::Unpaired;
            self.certificate = None;
            self.certificate_fingerprint.clear();
            (None, DeviceEvent::Paired(false))
        }
    }

    /// Whether the pair timer has actually elapsed. The caller races a
    /// `tokio::time::sleep` against the command queue; this method is
    /// the authoritative check once that sleep future resolves, so a
    /// pair packet that arrives right at the deadline is not clobbered by
    /// a stale timer.
    pub fn pair_deadline_elapsed(&self) -> bool {
        matches!(self.pair_deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Pair timeout: behaves exactly as receiving `pair:{pair:false}`
    /// while `pair_in_progress`.
    pub fn pair_timeout(&mut self) -> Option<DeviceEvent> {
        if !self.pair_in_progress || !self.pair_deadline_elapsed() {
            return None;
        }
        warn!(device_id = %self.device_id, "pair request timed out");
        let (_, event) = self.handle_pair_packet(false);
        Some(event)
    }

    fn cancel_pair_timer(&mut self) {
        self.pair_in_progress = false;
        self.pair_deadline = None;
    }

    // ---- implicit pairing inference + dispatch ----

    /// Process one inbound application packet on a secured channel.
    /// Returns any reply packet the caller must send back over the
    /// channel, and the events to emit (an optional implicit-pair event
    /// followed by the message event).
    pub fn handle_message(&mut self, packet: Packet) -> (Option<Packet>, Vec<DeviceEvent>) {
        if packet.is_type("kdeconnect.pair") {
            let pair = packet.get_body_field::<bool>("pair").unwrap_or(false);
            let (reply, event) = self.handle_pair_packet(pair);
            return (reply, vec![event]);
        }

        let mut events = Vec::new();
        if !self.is_paired {
            info!(device_id = %self.device_id, "inferring pairing from unsolicited application packet");
            self.is_paired = true;
            self.pair_state = PairState::Paired;
            events.push(DeviceEvent::Paired(true));
        }
        events.push(DeviceEvent::Message(packet));
        (None, events)
    }

    // ---- capability merging ----

    /// Apply a fresh discovery observation. Returns whether the host
    /// changed (the caller must deactivate before swapping endpoints)
    /// and the capability delta events to emit.
    pub fn update_from_device(&mut self, other: DiscoveredDevice) -> (bool, Vec<DeviceEvent>) {
        let new_effective: HashSet<String> = other
            .outgoing_capabilities
            .union(&other.incoming_capabilities)
            .cloned()
            .collect();

        let added: Vec<String> = new_effective
            .difference(&self.effective_capabilities)
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .effective_capabilities
            .difference(&new_effective)
            .cloned()
            .collect();

        let mut events = Vec::new();
        for cap in &added {
            events.push(DeviceEvent::CapabilityAdded(cap.clone()));
        }
        for cap in &removed {
            events.push(DeviceEvent::CapabilityRemoved(cap.clone()));
            if let Some(mut handler) = self.handlers.remove(cap) {
                handler.release_device(&self.device_id);
            }
        }

        self.outgoing_capabilities = other.outgoing_capabilities;
        self.incoming_capabilities = other.incoming_capabilities;
        self.effective_capabilities = new_effective;

        let host_changed = self.host != Some(other.host);
        if host_changed {
            self.host = Some(other.host);
        }
        self.tcp_port = other.tcp_port;

        (host_changed, events)
    }

    // ---- handler registry ----

    /// Register `handler` for `capability`. Fails with
    /// `CoreError::DuplicateHandler` if one is already registered — this
    /// is a checked contract violation, not a recoverable condition.
    pub fn register_capability_handler(
        &mut self,
        capability: &str,
        mut handler: Box<dyn CapabilityHandler>,
    ) -> Result<()> {
        if self.handlers.contains_key(capability) {
            return Err(CoreError::DuplicateHandler {
                device_id: self.device_id.clone(),
                capability: capability.to_string(),
            });
        }
        handler.use_device(&self.device_id);
        self.handlers.insert(capability.to_string(), handler);
        Ok(())
    }

    pub fn unregister_capability_handler(&mut self, capability: &str) {
        if let Some(mut handler) = self.handlers.remove(capability) {
            handler.release_device(&self.device_id);
        }
    }

    pub fn has_handler(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }
}
