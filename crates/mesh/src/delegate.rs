// Delegate interface - the only calls the coordination core makes into the
// collaborating presentation layer

use crate::DiscoveredPeer;
use image::DynamicImage;

/// Snapshot of invitable peers handed to the collaborator when a manual
/// peer-picker is requested. The collaborator invites through the
/// coordinator and finishes the flow with `finish_picker`.
#[derive(Debug, Clone)]
pub struct PickerHandle {
    pub candidates: Vec<DiscoveredPeer>,
}

/// Notifications from the session coordinator to its collaborator.
///
/// The relationship is one-directional: the coordinator holds the delegate
/// as a shared trait object and never expects calls back through it.
pub trait SessionDelegate: Send + Sync {
    /// A decoded image arrived from the named peer.
    fn image_received(&self, peer_name: &str, image: DynamicImage);

    /// A non-fatal failure occurred; `operation` labels the action that
    /// failed ("Send Error", "Receive Error", ...).
    fn display_error(&self, operation: &str, detail: &str);

    /// The number of connected peers changed (or was recomputed).
    fn peer_count_changed(&self, count: usize);

    /// A manual peer-picker was requested; the handle carries the current
    /// invitable candidates.
    fn present_picker(&self, picker: PickerHandle);

    /// The manual peer-picker flow ended.
    fn close_picker(&self, success: bool);
}
