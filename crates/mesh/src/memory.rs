// In-process transport - links endpoints through a shared hub so the
// coordination layer can be exercised without sockets or radios

use crate::transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::{DiscoveryInfo, MeshError, PeerId, PeerIdentity, Result, SessionState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

struct Endpoint {
    identity: PeerIdentity,
    events: mpsc::Sender<TransportEvent>,
    advertised: Option<DiscoveryInfo>,
    browsing: bool,
    connected: HashSet<PeerId>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<PeerId, Endpoint>,
    /// Every (inviter, invitee) pair observed, in order.
    invite_log: Vec<(PeerId, PeerId)>,
}

/// Shared registry connecting `MemoryTransport` endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<RwLock<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint for the given identity and return its transport
    /// together with the event receiver the owner consumes.
    pub async fn endpoint(
        &self,
        identity: PeerIdentity,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut inner = self.inner.write().await;
        inner.endpoints.insert(
            identity.peer_id.clone(),
            Endpoint {
                identity: identity.clone(),
                events: tx,
                advertised: None,
                browsing: false,
                connected: HashSet::new(),
            },
        );
        drop(inner);

        let transport = Arc::new(MemoryTransport {
            hub: self.clone(),
            local: identity,
            fail_next_send: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// All invitations issued through this hub, in order.
    pub async fn invite_log(&self) -> Vec<(PeerId, PeerId)> {
        self.inner.read().await.invite_log.clone()
    }
}

/// Transport endpoint backed by a `MemoryHub`
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerIdentity,
    fail_next_send: AtomicBool,
}

type Outbox = Vec<(mpsc::Sender<TransportEvent>, TransportEvent)>;

async fn deliver(outbox: Outbox) {
    for (tx, event) in outbox {
        // A dropped receiver just means the endpoint went away.
        let _ = tx.send(event).await;
    }
}

impl MemoryTransport {
    /// Make the next `send` call fail, as if the channel rejected the write.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    /// Push an event into this endpoint's own event stream. Lets tests
    /// replay duplicate or out-of-order transport events.
    pub async fn inject_event(&self, event: TransportEvent) {
        let tx = {
            let inner = self.hub.inner.read().await;
            inner
                .endpoints
                .get(&self.local.peer_id)
                .map(|e| e.events.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start_advertising(&self, identity: &PeerIdentity, info: &DiscoveryInfo) -> Result<()> {
        let mut outbox: Outbox = Vec::new();
        {
            let mut inner = self.hub.inner.write().await;
            for endpoint in inner.endpoints.values() {
                if endpoint.browsing && endpoint.identity.peer_id != identity.peer_id {
                    outbox.push((
                        endpoint.events.clone(),
                        TransportEvent::PeerFound {
                            peer: identity.clone(),
                            info: info.clone(),
                        },
                    ));
                }
            }
            let endpoint = inner
                .endpoints
                .get_mut(&identity.peer_id)
                .ok_or_else(|| MeshError::TransportUnavailable("endpoint not registered".into()))?;
            endpoint.advertised = Some(info.clone());
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut outbox: Outbox = Vec::new();
        {
            let mut inner = self.hub.inner.write().await;
            let was_advertising = inner
                .endpoints
                .get_mut(&self.local.peer_id)
                .map(|e| e.advertised.take().is_some())
                .unwrap_or(false);
            if was_advertising {
                for endpoint in inner.endpoints.values() {
                    if endpoint.browsing && endpoint.identity.peer_id != self.local.peer_id {
                        outbox.push((
                            endpoint.events.clone(),
                            TransportEvent::PeerLost {
                                peer_id: self.local.peer_id.clone(),
                            },
                        ));
                    }
                }
            }
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn start_browsing(&self, identity: &PeerIdentity) -> Result<()> {
        let mut outbox: Outbox = Vec::new();
        {
            let mut inner = self.hub.inner.write().await;
            let advertisers: Vec<(PeerIdentity, DiscoveryInfo)> = inner
                .endpoints
                .values()
                .filter(|e| e.identity.peer_id != identity.peer_id)
                .filter_map(|e| {
                    e.advertised
                        .as_ref()
                        .map(|info| (e.identity.clone(), info.clone()))
                })
                .collect();

            let endpoint = inner
                .endpoints
                .get_mut(&identity.peer_id)
                .ok_or_else(|| MeshError::TransportUnavailable("endpoint not registered".into()))?;
            endpoint.browsing = true;

            for (peer, info) in advertisers {
                outbox.push((
                    endpoint.events.clone(),
                    TransportEvent::PeerFound { peer, info },
                ));
            }
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        let mut inner = self.hub.inner.write().await;
        if let Some(endpoint) = inner.endpoints.get_mut(&self.local.peer_id) {
            endpoint.browsing = false;
        }
        Ok(())
    }

    async fn invite(&self, peer_id: &PeerId, _timeout: Duration) -> Result<()> {
        let mut outbox: Outbox = Vec::new();
        {
            let mut inner = self.hub.inner.write().await;
            if !inner.endpoints.contains_key(peer_id) {
                return Err(MeshError::PeerNotFound(peer_id.clone()));
            }

            let already_connected = inner
                .endpoints
                .get(&self.local.peer_id)
                .map(|e| e.connected.contains(peer_id))
                .unwrap_or(false);
            if already_connected {
                debug!("Dropping duplicate invite to {}", peer_id);
                return Ok(());
            }

            inner
                .invite_log
                .push((self.local.peer_id.clone(), peer_id.clone()));

            let local = inner
                .endpoints
                .get(&self.local.peer_id)
                .ok_or_else(|| MeshError::TransportUnavailable("endpoint not registered".into()))?;
            let remote = inner
                .endpoints
                .get(peer_id)
                .ok_or_else(|| MeshError::PeerNotFound(peer_id.clone()))?;
            let local_tx = local.events.clone();
            let remote_tx = remote.events.clone();
            let local_identity = local.identity.clone();
            let remote_identity = remote.identity.clone();

            for state in [SessionState::Connecting, SessionState::Connected] {
                outbox.push((
                    local_tx.clone(),
                    TransportEvent::StateChanged {
                        peer: remote_identity.clone(),
                        state,
                    },
                ));
                outbox.push((
                    remote_tx.clone(),
                    TransportEvent::StateChanged {
                        peer: local_identity.clone(),
                        state,
                    },
                ));
            }

            let local_id = self.local.peer_id.clone();
            if let Some(endpoint) = inner.endpoints.get_mut(&local_id) {
                endpoint.connected.insert(peer_id.clone());
            }
            if let Some(endpoint) = inner.endpoints.get_mut(peer_id) {
                endpoint.connected.insert(local_id);
            }
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn send(&self, payload: &[u8], to_peers: &[PeerId]) -> Result<()> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(MeshError::Send("injected send failure".into()));
        }

        let mut outbox: Outbox = Vec::new();
        {
            let inner = self.hub.inner.read().await;
            let local = inner
                .endpoints
                .get(&self.local.peer_id)
                .ok_or_else(|| MeshError::Send("endpoint not registered".into()))?;
            for peer_id in to_peers {
                if !local.connected.contains(peer_id) {
                    return Err(MeshError::Send(format!("no session with {}", peer_id)));
                }
                let remote = inner
                    .endpoints
                    .get(peer_id)
                    .ok_or_else(|| MeshError::Send(format!("no session with {}", peer_id)))?;
                outbox.push((
                    remote.events.clone(),
                    TransportEvent::PayloadReceived {
                        from: self.local.clone(),
                        bytes: payload.to_vec(),
                    },
                ));
            }
        }
        deliver(outbox).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut outbox: Outbox = Vec::new();
        {
            let mut inner = self.hub.inner.write().await;
            let connected: Vec<PeerId> = inner
                .endpoints
                .get_mut(&self.local.peer_id)
                .map(|e| e.connected.drain().collect())
                .unwrap_or_default();

            let local_tx = inner
                .endpoints
                .get(&self.local.peer_id)
                .map(|e| e.events.clone());

            for peer_id in connected {
                if let Some(remote) = inner.endpoints.get_mut(&peer_id) {
                    remote.connected.remove(&self.local.peer_id);
                    outbox.push((
                        remote.events.clone(),
                        TransportEvent::StateChanged {
                            peer: self.local.clone(),
                            state: SessionState::NotConnected,
                        },
                    ));
                    if let Some(local_tx) = &local_tx {
                        outbox.push((
                            local_tx.clone(),
                            TransportEvent::StateChanged {
                                peer: remote.identity.clone(),
                                state: SessionState::NotConnected,
                            },
                        ));
                    }
                }
            }
        }
        deliver(outbox).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DiscoveryInfo {
        DiscoveryInfo::from([("subject".to_string(), "snapmesh-demo".to_string())])
    }

    #[tokio::test]
    async fn test_browser_sees_existing_advertiser() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, _a_rx) = hub.endpoint(alice.clone()).await;
        let (b, mut b_rx) = hub.endpoint(bob.clone()).await;

        a.start_advertising(&alice, &info()).await.unwrap();
        b.start_browsing(&bob).await.unwrap();

        match b_rx.recv().await.unwrap() {
            TransportEvent::PeerFound { peer, info: found } => {
                assert_eq!(peer, alice);
                assert_eq!(found, info());
            }
            other => panic!("expected PeerFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invite_connects_both_sides() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, mut a_rx) = hub.endpoint(alice.clone()).await;
        let (_b, mut b_rx) = hub.endpoint(bob.clone()).await;

        a.invite(&bob.peer_id, Duration::from_secs(30)).await.unwrap();

        let mut a_states = Vec::new();
        let mut b_states = Vec::new();
        for _ in 0..2 {
            if let Some(TransportEvent::StateChanged { state, .. }) = a_rx.recv().await {
                a_states.push(state);
            }
            if let Some(TransportEvent::StateChanged { state, .. }) = b_rx.recv().await {
                b_states.push(state);
            }
        }
        assert_eq!(
            a_states,
            vec![SessionState::Connecting, SessionState::Connected]
        );
        assert_eq!(
            b_states,
            vec![SessionState::Connecting, SessionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_duplicate_invite_is_dropped() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, _a_rx) = hub.endpoint(alice.clone()).await;
        let (_b, _b_rx) = hub.endpoint(bob.clone()).await;

        a.invite(&bob.peer_id, Duration::from_secs(30)).await.unwrap();
        a.invite(&bob.peer_id, Duration::from_secs(30)).await.unwrap();

        assert_eq!(hub.invite_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, _a_rx) = hub.endpoint(alice.clone()).await;
        let (_b, _b_rx) = hub.endpoint(bob.clone()).await;

        let result = a.send(b"payload", &[bob.peer_id.clone()]).await;
        assert!(matches!(result, Err(MeshError::Send(_))));
    }

    #[tokio::test]
    async fn test_send_delivers_to_connected_peer() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, _a_rx) = hub.endpoint(alice.clone()).await;
        let (_b, mut b_rx) = hub.endpoint(bob.clone()).await;

        a.invite(&bob.peer_id, Duration::from_secs(30)).await.unwrap();

        // Skip the two state-change events.
        b_rx.recv().await;
        b_rx.recv().await;

        a.send(b"payload", &[bob.peer_id.clone()]).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::PayloadReceived { from, bytes } => {
                assert_eq!(from, alice);
                assert_eq!(bytes, b"payload");
            }
            other => panic!("expected PayloadReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_sides() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");
        let (a, mut a_rx) = hub.endpoint(alice.clone()).await;
        let (_b, mut b_rx) = hub.endpoint(bob.clone()).await;

        a.invite(&bob.peer_id, Duration::from_secs(30)).await.unwrap();
        for _ in 0..2 {
            a_rx.recv().await;
            b_rx.recv().await;
        }

        a.disconnect().await.unwrap();
        assert!(matches!(
            a_rx.recv().await.unwrap(),
            TransportEvent::StateChanged {
                state: SessionState::NotConnected,
                ..
            }
        ));
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::StateChanged {
                state: SessionState::NotConnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_sessions_is_noop() {
        let hub = MemoryHub::new();
        let alice = PeerIdentity::generate("alice");
        let (a, _a_rx) = hub.endpoint(alice).await;
        a.disconnect().await.unwrap();
        a.disconnect().await.unwrap();
    }
}
