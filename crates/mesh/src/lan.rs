// LAN transport - mDNS announcements for discovery plus TCP sessions for
// invitations and payload delivery

use crate::mdns::{LanPeer, MdnsAnnouncer, MdnsBrowser, MdnsPeerEvent};
use crate::transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::{DiscoveryInfo, MeshError, PeerId, PeerIdentity, Result, SessionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for a single wire frame (a payload is one encoded image)
const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// How long an inbound connection may take to complete its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound queue depth per session
const SESSION_QUEUE_CAPACITY: usize = 32;

/// Messages exchanged over a TCP session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum LanMessage {
    Hello { identity: PeerIdentity },
    Invite { from: PeerIdentity },
    Accept { from: PeerIdentity },
    Reject { from: PeerIdentity },
    Payload { bytes: Vec<u8> },
}

impl LanMessage {
    fn kind(&self) -> &'static str {
        match self {
            LanMessage::Hello { .. } => "Hello",
            LanMessage::Invite { .. } => "Invite",
            LanMessage::Accept { .. } => "Accept",
            LanMessage::Reject { .. } => "Reject",
            LanMessage::Payload { .. } => "Payload",
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<LanMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MeshError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &LanMessage) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(MeshError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// An established session: outbound queue plus the tasks pumping the socket
struct Session {
    peer: PeerIdentity,
    tx: mpsc::Sender<LanMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// State shared between the transport, its accept loop, and session tasks
#[derive(Clone)]
struct ConnCtx {
    local: PeerIdentity,
    events: mpsc::Sender<TransportEvent>,
    sessions: Arc<RwLock<HashMap<PeerId, Session>>>,
    pending: Arc<RwLock<HashSet<PeerId>>>,
    advertised: Arc<RwLock<Option<DiscoveryInfo>>>,
}

impl ConnCtx {
    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    async fn emit_state(&self, peer: PeerIdentity, state: SessionState) {
        self.emit(TransportEvent::StateChanged { peer, state }).await;
    }
}

/// Remove a session and report the peer as no longer connected. Idempotent:
/// whichever side of the session pump fails first wins the removal.
async fn close_session(ctx: &ConnCtx, peer_id: &PeerId) {
    let session = ctx.sessions.write().await.remove(peer_id);
    if let Some(session) = session {
        info!("Session with {} closed", session.peer.display_name);
        ctx.emit_state(session.peer.clone(), SessionState::NotConnected)
            .await;
        session.reader.abort();
        session.writer.abort();
    }
}

/// Spawn the read/write pumps for an accepted stream and record the session.
/// Returns false (dropping the stream) when a session with the peer already
/// exists.
async fn register_session(ctx: &ConnCtx, peer: PeerIdentity, stream: TcpStream) -> bool {
    let mut sessions = ctx.sessions.write().await;
    if sessions.contains_key(&peer.peer_id) {
        debug!("Session with {} already established", peer.peer_id);
        return false;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<LanMessage>(SESSION_QUEUE_CAPACITY);

    let writer_ctx = ctx.clone();
    let writer_peer = peer.peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &message).await {
                warn!("Session write to {} failed: {}", writer_peer, e);
                break;
            }
        }
        close_session(&writer_ctx, &writer_peer).await;
    });

    let reader_ctx = ctx.clone();
    let reader_peer = peer.clone();
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(LanMessage::Payload { bytes }) => {
                    reader_ctx
                        .emit(TransportEvent::PayloadReceived {
                            from: reader_peer.clone(),
                            bytes,
                        })
                        .await;
                }
                Ok(other) => {
                    debug!("Ignoring unexpected {} frame in session", other.kind());
                }
                Err(_) => break,
            }
        }
        close_session(&reader_ctx, &reader_peer.peer_id).await;
    });

    sessions.insert(
        peer.peer_id.clone(),
        Session {
            peer,
            tx,
            reader,
            writer,
        },
    );
    true
}

/// Handle one inbound connection: Hello/Invite handshake, auto-accepting
/// while the local peer is advertising.
async fn handle_inbound(ctx: ConnCtx, mut stream: TcpStream) {
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let hello = read_frame(&mut stream).await?;
        let identity = match hello {
            LanMessage::Hello { identity } => identity,
            other => {
                return Err(MeshError::InviteFailed(format!(
                    "expected Hello, got {}",
                    other.kind()
                )))
            }
        };

        let invite = read_frame(&mut stream).await?;
        match invite {
            LanMessage::Invite { from } if from.peer_id == identity.peer_id => Ok(from),
            other => Err(MeshError::InviteFailed(format!(
                "expected Invite, got {}",
                other.kind()
            ))),
        }
    })
    .await;

    let peer = match handshake {
        Ok(Ok(peer)) => peer,
        Ok(Err(e)) => {
            debug!("Dropping inbound connection: {}", e);
            return;
        }
        Err(_) => {
            debug!("Inbound handshake timed out");
            return;
        }
    };

    if ctx.advertised.read().await.is_none() {
        debug!("Rejecting invite from {}: not hosting", peer.display_name);
        let _ = write_frame(
            &mut stream,
            &LanMessage::Reject {
                from: ctx.local.clone(),
            },
        )
        .await;
        return;
    }

    if ctx.sessions.read().await.contains_key(&peer.peer_id) {
        debug!("Dropping duplicate invite from {}", peer.display_name);
        let _ = write_frame(
            &mut stream,
            &LanMessage::Reject {
                from: ctx.local.clone(),
            },
        )
        .await;
        return;
    }

    info!("Accepting invite from {}", peer.display_name);
    ctx.emit_state(peer.clone(), SessionState::Connecting).await;

    let accept = LanMessage::Accept {
        from: ctx.local.clone(),
    };
    if let Err(e) = write_frame(&mut stream, &accept).await {
        warn!("Failed to acknowledge invite: {}", e);
        ctx.emit_state(peer, SessionState::NotConnected).await;
        return;
    }

    if register_session(&ctx, peer.clone(), stream).await {
        ctx.emit_state(peer, SessionState::Connected).await;
    }
}

/// Transport over the local network: peers announce themselves via mDNS and
/// exchange payloads over length-prefixed JSON frames on TCP sessions.
pub struct LanTransport {
    ctx: ConnCtx,
    listen_port: u16,
    discovered: Arc<RwLock<HashMap<PeerId, LanPeer>>>,
    announcer: RwLock<Option<MdnsAnnouncer>>,
    browser: RwLock<Option<MdnsBrowser>>,
    accept_task: JoinHandle<()>,
}

impl LanTransport {
    /// Bind the session listener and return the transport together with the
    /// event receiver its owner consumes.
    pub async fn bind(
        local: PeerIdentity,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| MeshError::TransportUnavailable(format!("cannot bind listener: {}", e)))?;
        let listen_port = listener
            .local_addr()
            .map_err(|e| MeshError::TransportUnavailable(e.to_string()))?
            .port();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = ConnCtx {
            local,
            events: events_tx,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashSet::new())),
            advertised: Arc::new(RwLock::new(None)),
        };

        let accept_ctx = ctx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Inbound connection from {}", addr);
                        tokio::spawn(handle_inbound(accept_ctx.clone(), stream));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }
        });

        info!("Session listener bound on port {}", listen_port);

        Ok((
            Self {
                ctx,
                listen_port,
                discovered: Arc::new(RwLock::new(HashMap::new())),
                announcer: RwLock::new(None),
                browser: RwLock::new(None),
                accept_task,
            },
            events_rx,
        ))
    }

    /// Port the session listener is bound to
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    #[cfg(test)]
    async fn insert_discovered(&self, peer: LanPeer) {
        self.discovered
            .write()
            .await
            .insert(peer.identity.peer_id.clone(), peer);
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn start_advertising(&self, identity: &PeerIdentity, info: &DiscoveryInfo) -> Result<()> {
        let mut announcer_guard = self.announcer.write().await;
        if announcer_guard.is_some() {
            warn!("Advertising already active");
            return Ok(());
        }

        let announcer = MdnsAnnouncer::new(identity.clone(), info.clone(), self.listen_port)?;
        announcer.start().await?;
        *announcer_guard = Some(announcer);
        *self.ctx.advertised.write().await = Some(info.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut announcer_guard = self.announcer.write().await;
        if let Some(announcer) = announcer_guard.take() {
            announcer.stop().await?;
        }
        *self.ctx.advertised.write().await = None;
        Ok(())
    }

    async fn start_browsing(&self, identity: &PeerIdentity) -> Result<()> {
        let mut browser_guard = self.browser.write().await;
        if browser_guard.is_some() {
            warn!("Browsing already active");
            return Ok(());
        }

        let browser = MdnsBrowser::new()?;
        let local_id = identity.peer_id.clone();
        let discovered = Arc::clone(&self.discovered);
        let events = self.ctx.events.clone();

        browser
            .start(move |event| {
                let discovered = Arc::clone(&discovered);
                let events = events.clone();
                let local_id = local_id.clone();
                tokio::spawn(async move {
                    match event {
                        MdnsPeerEvent::Resolved(peer) => {
                            if peer.identity.peer_id == local_id {
                                return;
                            }
                            let found = TransportEvent::PeerFound {
                                peer: peer.identity.clone(),
                                info: peer.info.clone(),
                            };
                            discovered
                                .write()
                                .await
                                .insert(peer.identity.peer_id.clone(), peer);
                            let _ = events.send(found).await;
                        }
                        MdnsPeerEvent::Removed(peer_id) => {
                            if peer_id == local_id {
                                return;
                            }
                            discovered.write().await.remove(&peer_id);
                            let _ = events.send(TransportEvent::PeerLost { peer_id }).await;
                        }
                    }
                });
            })
            .await?;

        *browser_guard = Some(browser);
        Ok(())
    }

    async fn stop_browsing(&self) -> Result<()> {
        let mut browser_guard = self.browser.write().await;
        if let Some(browser) = browser_guard.take() {
            browser.stop().await?;
        }
        self.discovered.write().await.clear();
        Ok(())
    }

    async fn invite(&self, peer_id: &PeerId, timeout: Duration) -> Result<()> {
        let peer = self
            .discovered
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.clone()))?;

        if self.ctx.sessions.read().await.contains_key(peer_id) {
            debug!("Dropping invite to already-connected peer {}", peer_id);
            return Ok(());
        }
        {
            let mut pending = self.ctx.pending.write().await;
            if !pending.insert(peer_id.clone()) {
                debug!("Invite to {} already in flight", peer_id);
                return Ok(());
            }
        }

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let identity = peer.identity.clone();
            ctx.emit_state(identity.clone(), SessionState::Connecting)
                .await;

            let outcome = tokio::time::timeout(timeout, connect_and_invite(&ctx, &peer)).await;
            ctx.pending.write().await.remove(&identity.peer_id);

            match outcome {
                Ok(Ok(stream)) => {
                    if register_session(&ctx, identity.clone(), stream).await {
                        info!("Invite to {} accepted", identity.display_name);
                    }
                    ctx.emit_state(identity, SessionState::Connected).await;
                }
                Ok(Err(e)) => {
                    debug!("Invite to {} failed: {}", identity.display_name, e);
                    ctx.emit_state(identity, SessionState::NotConnected).await;
                }
                Err(_) => {
                    debug!("Invite to {} timed out", identity.display_name);
                    ctx.emit_state(identity, SessionState::NotConnected).await;
                }
            }
        });

        Ok(())
    }

    async fn send(&self, payload: &[u8], to_peers: &[PeerId]) -> Result<()> {
        let sessions = self.ctx.sessions.read().await;

        let mut queues = Vec::with_capacity(to_peers.len());
        for peer_id in to_peers {
            let session = sessions
                .get(peer_id)
                .ok_or_else(|| MeshError::Send(format!("no session with {}", peer_id)))?;
            queues.push(session.tx.clone());
        }
        drop(sessions);

        for queue in queues {
            queue
                .send(LanMessage::Payload {
                    bytes: payload.to_vec(),
                })
                .await
                .map_err(|_| MeshError::Send("session queue closed".into()))?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let peer_ids: Vec<PeerId> = self.ctx.sessions.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            close_session(&self.ctx, &peer_id).await;
        }
        Ok(())
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Dial a discovered peer and run the invite handshake, returning the
/// established stream on acceptance.
async fn connect_and_invite(ctx: &ConnCtx, peer: &LanPeer) -> Result<TcpStream> {
    let mut stream = None;
    for addr in &peer.addresses {
        let target = SocketAddr::new(*addr, peer.port);
        match TcpStream::connect(target).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => debug!("Connect to {} failed: {}", target, e),
        }
    }
    let mut stream = stream.ok_or_else(|| {
        MeshError::InviteFailed(format!("no reachable address for {}", peer.identity.peer_id))
    })?;

    write_frame(
        &mut stream,
        &LanMessage::Hello {
            identity: ctx.local.clone(),
        },
    )
    .await?;
    write_frame(
        &mut stream,
        &LanMessage::Invite {
            from: ctx.local.clone(),
        },
    )
    .await?;

    match read_frame(&mut stream).await? {
        LanMessage::Accept { .. } => Ok(stream),
        LanMessage::Reject { .. } => Err(MeshError::InviteFailed("invitation rejected".into())),
        other => Err(MeshError::InviteFailed(format!(
            "unexpected {} reply to invite",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn demo_info() -> DiscoveryInfo {
        DiscoveryInfo::from([("subject".to_string(), "snapmesh-demo".to_string())])
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let message = LanMessage::Payload {
            bytes: vec![1, 2, 3, 4, 5],
        };
        let mut write_cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut write_cursor, &message).await.unwrap();

        let mut read_cursor = std::io::Cursor::new(write_cursor.into_inner());
        let back = read_frame(&mut read_cursor).await.unwrap();
        assert!(matches!(back, LanMessage::Payload { bytes } if bytes == vec![1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(MeshError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_invite_unknown_peer_fails() {
        let local = PeerIdentity::generate("alice");
        let (transport, _rx) = LanTransport::bind(local).await.unwrap();
        let result = transport
            .invite(&"missing".to_string(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(MeshError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let local = PeerIdentity::generate("alice");
        let (transport, _rx) = LanTransport::bind(local).await.unwrap();
        let result = transport.send(b"payload", &["missing".to_string()]).await;
        assert!(matches!(result, Err(MeshError::Send(_))));
    }

    #[tokio::test]
    async fn test_invite_session_and_payload_over_loopback() {
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");

        let (alice_t, mut alice_rx) = LanTransport::bind(alice.clone()).await.unwrap();
        let (bob_t, mut bob_rx) = LanTransport::bind(bob.clone()).await.unwrap();

        // Bob hosts; seed Alice's discovery state directly so the test does
        // not depend on multicast reaching the loopback interface.
        *bob_t.ctx.advertised.write().await = Some(demo_info());
        alice_t
            .insert_discovered(LanPeer {
                identity: bob.clone(),
                info: demo_info(),
                addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                port: bob_t.listen_port(),
            })
            .await;

        alice_t
            .invite(&bob.peer_id, Duration::from_secs(5))
            .await
            .unwrap();

        // Alice observes Connecting then Connected.
        let mut alice_states = Vec::new();
        for _ in 0..2 {
            match alice_rx.recv().await.unwrap() {
                TransportEvent::StateChanged { state, .. } => alice_states.push(state),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            alice_states,
            vec![SessionState::Connecting, SessionState::Connected]
        );

        // Bob observes the same transitions for Alice.
        let mut bob_states = Vec::new();
        for _ in 0..2 {
            match bob_rx.recv().await.unwrap() {
                TransportEvent::StateChanged { peer, state } => {
                    assert_eq!(peer.peer_id, alice.peer_id);
                    bob_states.push(state);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            bob_states,
            vec![SessionState::Connecting, SessionState::Connected]
        );

        // A payload flows from Alice to Bob.
        alice_t
            .send(b"picture bytes", &[bob.peer_id.clone()])
            .await
            .unwrap();
        match bob_rx.recv().await.unwrap() {
            TransportEvent::PayloadReceived { from, bytes } => {
                assert_eq!(from.peer_id, alice.peer_id);
                assert_eq!(bytes, b"picture bytes");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Teardown reports the peer as gone on both sides.
        alice_t.disconnect().await.unwrap();
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            TransportEvent::StateChanged {
                state: SessionState::NotConnected,
                ..
            }
        ));
        assert!(matches!(
            bob_rx.recv().await.unwrap(),
            TransportEvent::StateChanged {
                state: SessionState::NotConnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invite_rejected_when_peer_not_hosting() {
        let alice = PeerIdentity::generate("alice");
        let bob = PeerIdentity::generate("bob");

        let (alice_t, mut alice_rx) = LanTransport::bind(alice.clone()).await.unwrap();
        let (bob_t, _bob_rx) = LanTransport::bind(bob.clone()).await.unwrap();

        alice_t
            .insert_discovered(LanPeer {
                identity: bob.clone(),
                info: demo_info(),
                addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                port: bob_t.listen_port(),
            })
            .await;

        alice_t
            .invite(&bob.peer_id, Duration::from_secs(5))
            .await
            .unwrap();

        let mut states = Vec::new();
        for _ in 0..2 {
            match alice_rx.recv().await.unwrap() {
                TransportEvent::StateChanged { state, .. } => states.push(state),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            states,
            vec![SessionState::Connecting, SessionState::NotConnected]
        );
    }
}
