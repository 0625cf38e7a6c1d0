// Transport abstraction - discovery, invitations, sessions, payload delivery

use crate::{DiscoveryInfo, PeerId, PeerIdentity, Result, SessionState};
use async_trait::async_trait;
use std::time::Duration;

/// Capacity of the transport event channel handed out at construction
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Asynchronous events emitted by a transport to its owner
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Browsing found an advertising peer together with its filter.
    PeerFound {
        peer: PeerIdentity,
        info: DiscoveryInfo,
    },
    /// A previously found peer stopped advertising.
    PeerLost { peer_id: PeerId },
    /// A peer's session state changed.
    StateChanged {
        peer: PeerIdentity,
        state: SessionState,
    },
    /// A payload arrived over an established session.
    PayloadReceived { from: PeerIdentity, bytes: Vec<u8> },
}

/// Discovery and session layer.
///
/// Implementations deliver `TransportEvent`s over the mpsc receiver returned
/// by their constructor. No method blocks on remote activity: invitations
/// resolve through state-change events, and all start/stop operations are
/// guarded no-ops when the transport is already in the requested state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin responding to discovery queries, advertising the given filter.
    async fn start_advertising(&self, identity: &PeerIdentity, info: &DiscoveryInfo) -> Result<()>;

    /// Stop responding to discovery queries.
    async fn stop_advertising(&self) -> Result<()>;

    /// Begin scanning for advertisers; found peers are reported as
    /// `PeerFound` events.
    async fn start_browsing(&self, identity: &PeerIdentity) -> Result<()>;

    /// Stop scanning for advertisers.
    async fn stop_browsing(&self) -> Result<()>;

    /// Ask a discovered peer to join the session. Duplicate invites to a
    /// peer that is already connected or being connected are dropped.
    async fn invite(&self, peer_id: &PeerId, timeout: Duration) -> Result<()>;

    /// Reliable delivery of one payload to the given peers. Fails with
    /// `MeshError::Send` when no session exists or a session write is
    /// rejected; no retry is attempted.
    async fn send(&self, payload: &[u8], to_peers: &[PeerId]) -> Result<()>;

    /// Tear down every established session.
    async fn disconnect(&self) -> Result<()>;
}
