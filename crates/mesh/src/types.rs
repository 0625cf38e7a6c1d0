use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a peer
pub type PeerId = String;

/// Key-value filter used to recognize compatible peers during discovery.
/// Two peers are considered compatible only when their maps are exactly equal.
pub type DiscoveryInfo = HashMap<String, String>;

/// Stable identity of a participant: an opaque identifier plus a human
/// display name. Created once per installation and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl PeerIdentity {
    /// Generate a fresh identity with a random stable identifier.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.peer_id)
    }
}

/// Transport-level connection state of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Connected,
    NotConnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::NotConnected => write!(f, "Not Connected"),
        }
    }
}

/// Coordinator-side lifecycle of a remote peer. A peer re-enters `Discovered`
/// when it is found again after dropping to `NotConnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Discovered,
    Inviting,
    Connecting,
    Connected,
    NotConnected,
}

impl std::fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerPhase::Discovered => write!(f, "Discovered"),
            PeerPhase::Inviting => write!(f, "Inviting"),
            PeerPhase::Connecting => write!(f, "Connecting"),
            PeerPhase::Connected => write!(f, "Connected"),
            PeerPhase::NotConnected => write!(f, "Not Connected"),
        }
    }
}

/// A peer found during browsing, together with the filter it advertised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    pub info: DiscoveryInfo,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    pub fn new(identity: PeerIdentity, info: DiscoveryInfo) -> Self {
        let now = Utc::now();
        Self {
            identity,
            info,
            discovered_at: now,
            last_seen: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_are_distinct() {
        let a = PeerIdentity::generate("alice");
        let b = PeerIdentity::generate("alice");
        assert_ne!(a.peer_id, b.peer_id);
        assert_eq!(a.display_name, b.display_name);
    }

    #[test]
    fn test_discovery_info_equality_gates_on_exact_match() {
        let mut a = DiscoveryInfo::new();
        a.insert("subject".to_string(), "snapmesh-demo".to_string());

        let mut b = a.clone();
        assert_eq!(a, b);

        b.insert("extra".to_string(), "value".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_serialization_roundtrip() {
        let identity = PeerIdentity::generate("alice");
        let json = serde_json::to_string(&identity).unwrap();
        let back: PeerIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(identity, back);
    }
}
