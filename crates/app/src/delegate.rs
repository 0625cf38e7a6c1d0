// Terminal collaborator - plays the presentation-layer role, printing
// notifications and saving received images to disk

use image::{DynamicImage, ImageFormat};
use mesh::{PickerHandle, SessionDelegate};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;

pub struct TerminalDelegate {
    received_dir: PathBuf,
    picker: Mutex<Option<PickerHandle>>,
    image_counter: AtomicUsize,
}

impl TerminalDelegate {
    pub fn new(received_dir: PathBuf) -> Self {
        Self {
            received_dir,
            picker: Mutex::new(None),
            image_counter: AtomicUsize::new(0),
        }
    }

    /// Current picker snapshot, if a picker flow is open.
    pub fn picker(&self) -> Option<PickerHandle> {
        self.picker.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn clear_picker(&self) {
        if let Ok(mut guard) = self.picker.lock() {
            *guard = None;
        }
    }
}

impl SessionDelegate for TerminalDelegate {
    fn image_received(&self, peer_name: &str, image: DynamicImage) {
        let n = self.image_counter.fetch_add(1, Ordering::SeqCst);
        let path = self.received_dir.join(format!("{}-{}.png", peer_name, n));

        if let Err(e) = std::fs::create_dir_all(&self.received_dir) {
            warn!("Cannot create {}: {}", self.received_dir.display(), e);
            return;
        }
        match image.save_with_format(&path, ImageFormat::Png) {
            Ok(()) => println!("Sent from: {} -> saved to {}", peer_name, path.display()),
            Err(e) => warn!("Cannot save received image: {}", e),
        }
    }

    fn display_error(&self, operation: &str, detail: &str) {
        println!("{}: {}", operation, detail);
    }

    fn peer_count_changed(&self, count: usize) {
        println!("Connections: {}", count);
    }

    fn present_picker(&self, picker: PickerHandle) {
        if picker.candidates.is_empty() {
            println!("No invitable peers found yet.");
        } else {
            println!("Invitable peers:");
            for (index, candidate) in picker.candidates.iter().enumerate() {
                println!("  [{}] {}", index, candidate.identity.display_name);
            }
            println!("Use 'pick <n>' to invite, 'done' or 'cancel' to close.");
        }
        if let Ok(mut guard) = self.picker.lock() {
            *guard = Some(picker);
        }
    }

    fn close_picker(&self, success: bool) {
        self.clear_picker();
        println!(
            "Peer picker closed{}.",
            if success { "" } else { " (cancelled)" }
        );
    }
}
