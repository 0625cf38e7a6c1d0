//! Peer-session coordination over an ad-hoc local mesh.
//!
//! Nearby peers discover each other, form a session through deterministic
//! invitations, and exchange image payloads. The presentation layer is an
//! external collaborator driven through [`SessionDelegate`].

pub mod codec;
pub mod coordinator;
pub mod delegate;
pub mod error;
pub mod identity;
pub mod lan;
pub mod mdns;
pub mod memory;
pub mod transport;
pub mod types;

pub use coordinator::{CoordinatorConfig, SessionCoordinator, DEFAULT_INVITE_TIMEOUT};
pub use delegate::{PickerHandle, SessionDelegate};
pub use error::{MeshError, Result};
pub use identity::IdentityStore;
pub use lan::LanTransport;
pub use memory::{MemoryHub, MemoryTransport};
pub use transport::{Transport, TransportEvent};
pub use types::{
    DiscoveredPeer, DiscoveryInfo, PeerId, PeerIdentity, PeerPhase, SessionState,
};
