// mDNS announce/browse layer for LAN discovery

use crate::{DiscoveryInfo, MeshError, PeerId, PeerIdentity, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SERVICE_TYPE: &str = "_snapmesh._tcp.local.";
const PROTOCOL_VERSION: &str = "1";
const INSTANCE_PREFIX: &str = "snapmesh-";
const INFO_PREFIX: &str = "info.";

/// A peer resolved from an mDNS announcement, with enough addressing
/// information to open a session to it
#[derive(Debug, Clone)]
pub struct LanPeer {
    pub identity: PeerIdentity,
    pub info: DiscoveryInfo,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

/// Discovery events forwarded by the browser
#[derive(Debug, Clone)]
pub enum MdnsPeerEvent {
    Resolved(LanPeer),
    Removed(PeerId),
}

/// Broadcasts the local peer's presence on the local network
pub struct MdnsAnnouncer {
    daemon: Arc<ServiceDaemon>,
    service_info: Arc<RwLock<Option<ServiceInfo>>>,
    identity: PeerIdentity,
    discovery_info: DiscoveryInfo,
    port: u16,
}

impl MdnsAnnouncer {
    pub fn new(identity: PeerIdentity, discovery_info: DiscoveryInfo, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| {
            MeshError::TransportUnavailable(format!("failed to create mDNS daemon: {}", e))
        })?;

        Ok(Self {
            daemon: Arc::new(daemon),
            service_info: Arc::new(RwLock::new(None)),
            identity,
            discovery_info,
            port,
        })
    }

    /// Start announcing presence. A second start while active is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut service_guard = self.service_info.write().await;

        if service_guard.is_some() {
            warn!("mDNS announcement already active");
            return Ok(());
        }

        info!(
            "Starting mDNS announcement for {} on port {}",
            self.identity.display_name, self.port
        );

        let instance_name = format!("{}{}", INSTANCE_PREFIX, self.identity.peer_id);
        let hostname = format!("{}.local.", instance_name);

        let mut properties = HashMap::new();
        properties.insert("peer_id".to_string(), self.identity.peer_id.clone());
        properties.insert("name".to_string(), self.identity.display_name.clone());
        properties.insert("version".to_string(), PROTOCOL_VERSION.to_string());
        for (key, value) in &self.discovery_info {
            properties.insert(format!("{}{}", INFO_PREFIX, key), value.clone());
        }

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &hostname,
            "",
            self.port,
            Some(properties),
        )
        .map_err(|e| MeshError::TransportUnavailable(format!("failed to create service info: {}", e)))?
        .enable_addr_auto();

        self.daemon
            .register(service_info.clone())
            .map_err(|e| MeshError::TransportUnavailable(format!("failed to register mDNS service: {}", e)))?;

        *service_guard = Some(service_info);
        Ok(())
    }

    /// Stop announcing presence. Safe to call when never started.
    pub async fn stop(&self) -> Result<()> {
        let mut service_guard = self.service_info.write().await;

        if let Some(service_info) = service_guard.take() {
            info!("Stopping mDNS announcement");
            self.daemon
                .unregister(service_info.get_fullname())
                .map_err(|e| {
                    MeshError::TransportUnavailable(format!("failed to unregister mDNS service: {}", e))
                })?;
        } else {
            debug!("No active mDNS announcement to stop");
        }

        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.service_info.read().await.is_some()
    }
}

/// Watches the local network for announcing peers
pub struct MdnsBrowser {
    daemon: Arc<ServiceDaemon>,
    running: Arc<RwLock<bool>>,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| {
            MeshError::TransportUnavailable(format!("failed to create mDNS daemon: {}", e))
        })?;

        Ok(Self {
            daemon: Arc::new(daemon),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start browsing; resolved and removed peers are forwarded to the
    /// callback from a background task.
    pub async fn start<F>(&self, on_event: F) -> Result<()>
    where
        F: Fn(MdnsPeerEvent) + Send + Sync + 'static,
    {
        let mut running = self.running.write().await;

        if *running {
            warn!("mDNS browser already running");
            return Ok(());
        }

        info!("Starting mDNS browse for service type {}", SERVICE_TYPE);

        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(|e| {
            MeshError::TransportUnavailable(format!("failed to browse mDNS services: {}", e))
        })?;

        *running = true;
        drop(running);

        let running_flag = Arc::clone(&self.running);
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                if !*running_flag.read().await {
                    debug!("mDNS browser stopped, exiting event loop");
                    break;
                }

                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        debug!("mDNS service resolved: {}", info.get_fullname());
                        if let Some(peer) = parse_service_info(&info) {
                            on_event(MdnsPeerEvent::Resolved(peer));
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("mDNS service removed: {}", fullname);
                        if let Some(peer_id) = extract_peer_id(&fullname) {
                            on_event(MdnsPeerEvent::Removed(peer_id));
                        }
                    }
                    ServiceEvent::SearchStarted(_) => {
                        debug!("mDNS search started");
                    }
                    ServiceEvent::SearchStopped(_) => {
                        debug!("mDNS search stopped");
                    }
                    _ => {
                        debug!("Unhandled mDNS event: {:?}", event);
                    }
                }
            }

            debug!("mDNS browse event loop terminated");
        });

        Ok(())
    }

    /// Stop browsing. Safe to call when never started.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;

        if !*running {
            debug!("mDNS browser not running");
            return Ok(());
        }

        info!("Stopping mDNS browse");
        *running = false;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Parse a resolved service record into a LanPeer
fn parse_service_info(service: &ServiceInfo) -> Option<LanPeer> {
    if let Some(version) = service.get_property_val_str("version") {
        if version != PROTOCOL_VERSION {
            warn!(
                "Ignoring peer with incompatible protocol version: {} (expected {})",
                version, PROTOCOL_VERSION
            );
            return None;
        }
    } else {
        return None;
    }

    let peer_id = service.get_property_val_str("peer_id")?.to_string();
    let display_name = service.get_property_val_str("name")?.to_string();

    let mut info = DiscoveryInfo::new();
    for property in service.get_properties().iter() {
        if let Some(key) = property.key().strip_prefix(INFO_PREFIX) {
            info.insert(key.to_string(), property.val_str().to_string());
        }
    }

    let addresses: Vec<IpAddr> = service
        .get_addresses()
        .iter()
        .map(|addr: &IpAddr| *addr)
        .collect();

    Some(LanPeer {
        identity: PeerIdentity {
            peer_id,
            display_name,
        },
        info,
        addresses,
        port: service.get_port(),
    })
}

/// Extract the peer id from an mDNS fullname.
/// Fullname format: "snapmesh-{peer_id}._snapmesh._tcp.local."
fn extract_peer_id(fullname: &str) -> Option<PeerId> {
    let instance_name = fullname.split('.').next()?;
    instance_name
        .strip_prefix(INSTANCE_PREFIX)
        .map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_for(identity: &PeerIdentity, version: &str) -> ServiceInfo {
        let instance = format!("{}{}", INSTANCE_PREFIX, identity.peer_id);
        let hostname = format!("{}.local.", instance);
        let mut properties = HashMap::new();
        properties.insert("peer_id".to_string(), identity.peer_id.clone());
        properties.insert("name".to_string(), identity.display_name.clone());
        properties.insert("version".to_string(), version.to_string());
        properties.insert("info.subject".to_string(), "snapmesh-demo".to_string());
        ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &hostname,
            "192.168.1.5",
            4000,
            Some(properties),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_service_info() {
        let identity = PeerIdentity::generate("alice");
        let peer = parse_service_info(&record_for(&identity, PROTOCOL_VERSION)).unwrap();

        assert_eq!(peer.identity, identity);
        assert_eq!(peer.info.get("subject").map(String::as_str), Some("snapmesh-demo"));
        assert_eq!(peer.port, 4000);
        assert!(!peer.addresses.is_empty());
    }

    #[test]
    fn test_parse_rejects_incompatible_version() {
        let identity = PeerIdentity::generate("alice");
        assert!(parse_service_info(&record_for(&identity, "99")).is_none());
    }

    #[test]
    fn test_extract_peer_id() {
        let fullname = "snapmesh-1234-abcd._snapmesh._tcp.local.";
        assert_eq!(extract_peer_id(fullname), Some("1234-abcd".to_string()));

        let invalid = "other-service._http._tcp.local.";
        assert_eq!(extract_peer_id(invalid), None);
    }

    #[tokio::test]
    async fn test_announcer_start_stop() {
        let identity = PeerIdentity::generate("alice");
        let info = DiscoveryInfo::from([("subject".to_string(), "snapmesh-demo".to_string())]);
        let announcer = MdnsAnnouncer::new(identity, info, 4000).unwrap();

        assert!(!announcer.is_active().await);
        announcer.start().await.unwrap();
        assert!(announcer.is_active().await);

        // Double start stays active without duplicating the announcement.
        announcer.start().await.unwrap();
        assert!(announcer.is_active().await);

        announcer.stop().await.unwrap();
        assert!(!announcer.is_active().await);

        // Stop after stop is a no-op.
        announcer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_browser_start_stop() {
        let browser = MdnsBrowser::new().unwrap();
        assert!(!browser.is_running().await);

        browser.start(|_event| {}).await.unwrap();
        assert!(browser.is_running().await);

        browser.stop().await.unwrap();
        assert!(!browser.is_running().await);
    }
}
