// Session coordinator - owns the transport, applies the invitation policy,
// tracks per-peer state, and notifies the collaborating presentation layer

use crate::codec;
use crate::delegate::{PickerHandle, SessionDelegate};
use crate::transport::{Transport, TransportEvent};
use crate::{
    DiscoveredPeer, DiscoveryInfo, MeshError, PeerId, PeerIdentity, PeerPhase, Result,
    SessionState,
};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default timeout handed to the transport for invitations
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Filter advertised by this peer; only exact matches are invited.
    pub discovery_info: DiscoveryInfo,
    pub invite_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(discovery_info: DiscoveryInfo) -> Self {
        Self {
            discovery_info,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
        }
    }
}

struct PeerEntry {
    identity: PeerIdentity,
    info: DiscoveryInfo,
    phase: PeerPhase,
    discovered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Coordinates one ad-hoc session over a transport.
///
/// All peer-state mutation funnels through a single shared map; transport
/// events are consumed by one background task, so discovery callbacks,
/// state changes, and count computation never race each other.
pub struct SessionCoordinator {
    identity: PeerIdentity,
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn SessionDelegate>,
    peers: Arc<RwLock<HashMap<PeerId, PeerEntry>>>,
    hosting: RwLock<bool>,
    browsing: RwLock<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Create the coordinator and start consuming transport events.
    pub async fn new(
        identity: PeerIdentity,
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            identity,
            config,
            transport,
            delegate,
            peers: Arc::new(RwLock::new(HashMap::new())),
            hosting: RwLock::new(false),
            browsing: RwLock::new(false),
            event_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match weak.upgrade() {
                    Some(this) => this.handle_event(event).await,
                    None => break,
                }
            }
            debug!("Coordinator event loop terminated");
        });
        *coordinator.event_task.lock().await = Some(task);

        coordinator
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, info } => self.on_peer_found(peer, info).await,
            TransportEvent::PeerLost { peer_id } => self.on_peer_lost(peer_id).await,
            TransportEvent::StateChanged { peer, state } => {
                self.on_state_changed(peer, state).await
            }
            TransportEvent::PayloadReceived { from, bytes } => {
                self.on_payload_received(from, bytes).await
            }
        }
    }

    /// Discovery reported a peer. A compatible peer is invited by exactly
    /// one side: the one whose stable identifier orders first.
    async fn on_peer_found(&self, peer: PeerIdentity, info: DiscoveryInfo) {
        if peer.peer_id == self.identity.peer_id {
            return;
        }

        let should_invite = {
            let mut peers = self.peers.write().await;
            let now = Utc::now();
            let entry = peers
                .entry(peer.peer_id.clone())
                .or_insert_with(|| PeerEntry {
                    identity: peer.clone(),
                    info: info.clone(),
                    phase: PeerPhase::Discovered,
                    discovered_at: now,
                    last_seen: now,
                });
            entry.identity = peer.clone();
            entry.info = info.clone();
            entry.last_seen = now;
            if entry.phase == PeerPhase::NotConnected {
                entry.phase = PeerPhase::Discovered;
            }

            if info != self.config.discovery_info {
                debug!(
                    "Peer {} advertises non-matching info, ignoring",
                    peer.display_name
                );
                false
            } else if entry.phase != PeerPhase::Discovered {
                debug!(
                    "Peer {} already {}, not inviting again",
                    peer.display_name, entry.phase
                );
                false
            } else if self.identity.peer_id < peer.peer_id {
                entry.phase = PeerPhase::Inviting;
                true
            } else {
                debug!(
                    "Compatible peer {} found, waiting for their invite",
                    peer.display_name
                );
                false
            }
        };

        if should_invite {
            info!("Inviting compatible peer {}", peer.display_name);
            if let Err(e) = self
                .transport
                .invite(&peer.peer_id, self.config.invite_timeout)
                .await
            {
                warn!("Invite to {} failed: {}", peer.display_name, e);
                self.delegate.display_error("Invite Error", &e.to_string());
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&peer.peer_id) {
                    if entry.phase == PeerPhase::Inviting {
                        entry.phase = PeerPhase::Discovered;
                    }
                }
            }
        }
    }

    async fn on_peer_lost(&self, peer_id: PeerId) {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get(&peer_id) {
            // A lost announcement does not tear down an established session.
            if matches!(entry.phase, PeerPhase::Discovered | PeerPhase::NotConnected) {
                info!("Lost peer {}", entry.identity.display_name);
                peers.remove(&peer_id);
            }
        }
    }

    /// Apply a session-state change and notify the collaborator with the
    /// recomputed count. Duplicate events are harmless: the count is derived
    /// from the map, so a repeated NotConnected never double-decrements.
    async fn on_state_changed(&self, peer: PeerIdentity, state: SessionState) {
        if peer.peer_id == self.identity.peer_id {
            return;
        }

        let phase = match state {
            SessionState::Connecting => PeerPhase::Connecting,
            SessionState::Connected => PeerPhase::Connected,
            SessionState::NotConnected => PeerPhase::NotConnected,
        };

        let count = {
            let mut peers = self.peers.write().await;
            let now = Utc::now();
            let entry = peers
                .entry(peer.peer_id.clone())
                .or_insert_with(|| PeerEntry {
                    identity: peer.clone(),
                    info: DiscoveryInfo::new(),
                    phase: PeerPhase::Discovered,
                    discovered_at: now,
                    last_seen: now,
                });
            entry.last_seen = now;
            if entry.phase != phase {
                info!("Peer {}: {}", peer.display_name, phase);
                entry.phase = phase;
            }
            peers
                .values()
                .filter(|e| e.phase == PeerPhase::Connected)
                .count()
        };

        self.delegate.peer_count_changed(count);
    }

    async fn on_payload_received(&self, from: PeerIdentity, bytes: Vec<u8>) {
        match codec::decode_image(&bytes) {
            Ok(image) => {
                info!(
                    "Received image ({} bytes) from {}",
                    bytes.len(),
                    from.display_name
                );
                self.delegate.image_received(&from.display_name, image);
            }
            Err(e) => {
                warn!("Undecodable payload from {}: {}", from.display_name, e);
                self.delegate.display_error("Receive Error", &e.to_string());
            }
        }
    }

    /// Begin answering discovery queries with the local filter.
    pub async fn start_hosting(&self) -> Result<()> {
        let mut hosting = self.hosting.write().await;
        if *hosting {
            debug!("Already hosting");
            return Ok(());
        }

        match self
            .transport
            .start_advertising(&self.identity, &self.config.discovery_info)
            .await
        {
            Ok(()) => {
                *hosting = true;
                info!("Hosting as {}", self.identity.display_name);
                Ok(())
            }
            Err(e) => {
                self.delegate.display_error("Hosting Error", &e.to_string());
                Err(e)
            }
        }
    }

    /// Begin scanning for advertising peers.
    pub async fn start_browsing(&self) -> Result<()> {
        let mut browsing = self.browsing.write().await;
        if *browsing {
            debug!("Already browsing");
            return Ok(());
        }

        match self.transport.start_browsing(&self.identity).await {
            Ok(()) => {
                *browsing = true;
                info!("Browsing for peers");
                Ok(())
            }
            Err(e) => {
                self.delegate
                    .display_error("Browsing Error", &e.to_string());
                Err(e)
            }
        }
    }

    /// Encode and send an image to every connected peer. With no connected
    /// peers this is a silent no-op; a transmission failure surfaces as a
    /// single "Send Error" notification and is not retried.
    pub async fn send_image(&self, image: &DynamicImage) {
        let bytes = match codec::encode_image(image) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.delegate.display_error("Encode Error", &e.to_string());
                return;
            }
        };

        let targets: Vec<PeerId> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|e| e.phase == PeerPhase::Connected)
                .map(|e| e.identity.peer_id.clone())
                .collect()
        };
        if targets.is_empty() {
            debug!("No connected peers, image not sent");
            return;
        }

        info!("Sending image ({} bytes) to {} peer(s)", bytes.len(), targets.len());
        if let Err(e) = self.transport.send(&bytes, &targets).await {
            warn!("Send failed: {}", e);
            self.delegate.display_error("Send Error", &e.to_string());
        }
    }

    /// Open the manual peer-picker: hands the collaborator a snapshot of
    /// invitable peers. Only peers advertising the exact local filter are
    /// candidates.
    pub async fn join_session(&self) {
        let candidates: Vec<DiscoveredPeer> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|e| {
                    e.phase == PeerPhase::Discovered && e.info == self.config.discovery_info
                })
                .map(|e| DiscoveredPeer {
                    identity: e.identity.clone(),
                    info: e.info.clone(),
                    discovered_at: e.discovered_at,
                    last_seen: e.last_seen,
                })
                .collect()
        };

        self.delegate.present_picker(PickerHandle { candidates });
    }

    /// Manually invite a discovered peer (picker flow). Duplicate attempts
    /// against a peer that is already being joined are suppressed.
    pub async fn invite_peer(&self, peer_id: &PeerId) -> Result<()> {
        {
            let mut peers = self.peers.write().await;
            let entry = peers
                .get_mut(peer_id)
                .ok_or_else(|| MeshError::PeerNotFound(peer_id.clone()))?;
            if entry.info != self.config.discovery_info {
                return Err(MeshError::InviteFailed(format!(
                    "peer {} is not compatible",
                    entry.identity.display_name
                )));
            }
            match entry.phase {
                PeerPhase::Inviting | PeerPhase::Connecting | PeerPhase::Connected => {
                    debug!("Peer {} already {}, invite suppressed", peer_id, entry.phase);
                    return Ok(());
                }
                PeerPhase::Discovered | PeerPhase::NotConnected => {
                    entry.phase = PeerPhase::Inviting;
                }
            }
        }

        let result = self
            .transport
            .invite(peer_id, self.config.invite_timeout)
            .await;
        if result.is_err() {
            let mut peers = self.peers.write().await;
            if let Some(entry) = peers.get_mut(peer_id) {
                if entry.phase == PeerPhase::Inviting {
                    entry.phase = PeerPhase::Discovered;
                }
            }
        }
        result
    }

    /// End the manual peer-picker flow.
    pub async fn finish_picker(&self, success: bool) {
        self.delegate.close_picker(success);
        self.delegate
            .peer_count_changed(self.connected_peer_count().await);
    }

    pub async fn connected_peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.phase == PeerPhase::Connected)
            .count()
    }

    /// Ordered roster: the local identity first, then every connected peer.
    pub async fn roster(&self) -> Vec<PeerIdentity> {
        let mut connected: Vec<PeerIdentity> = self
            .peers
            .read()
            .await
            .values()
            .filter(|e| e.phase == PeerPhase::Connected)
            .map(|e| e.identity.clone())
            .collect();
        connected.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });

        let mut roster = Vec::with_capacity(connected.len() + 1);
        roster.push(self.identity.clone());
        roster.extend(connected);
        roster
    }

    pub async fn peer_at(&self, index: usize) -> Option<PeerIdentity> {
        self.roster().await.into_iter().nth(index)
    }

    /// Peers currently invitable through the picker.
    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.phase == PeerPhase::Discovered && e.info == self.config.discovery_info)
            .map(|e| DiscoveredPeer {
                identity: e.identity.clone(),
                info: e.info.clone(),
                discovered_at: e.discovered_at,
                last_seen: e.last_seen,
            })
            .collect()
    }

    /// Every known peer with its current lifecycle phase.
    pub async fn peer_overview(&self) -> Vec<(PeerIdentity, PeerPhase)> {
        self.peers
            .read()
            .await
            .values()
            .map(|e| (e.identity.clone(), e.phase))
            .collect()
    }

    /// Tear the session down: stop advertising, stop browsing, disconnect.
    /// Every step is a guarded no-op when it was never started; calling
    /// shutdown twice is safe.
    pub async fn shutdown(&self) {
        info!("Shutting down session coordinator");

        {
            let mut hosting = self.hosting.write().await;
            if *hosting {
                if let Err(e) = self.transport.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }
                *hosting = false;
            }
        }
        {
            let mut browsing = self.browsing.write().await;
            if *browsing {
                if let Err(e) = self.transport.stop_browsing().await {
                    warn!("Failed to stop browsing: {}", e);
                }
                *browsing = false;
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect session: {}", e);
        }

        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
    }
}
