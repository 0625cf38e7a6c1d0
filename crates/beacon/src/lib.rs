//! Standalone Bluetooth beacon broadcaster.
//!
//! Toggled on and off independently of the peer session; an unavailable
//! radio is reported to the caller and leaves the beacon off.

pub mod broadcaster;
pub mod error;
pub mod radio;

pub use broadcaster::{BeaconBroadcaster, BeaconConfig, BeaconHandle};
pub use error::{BeaconError, BeaconResult};
pub use radio::{BeaconRadio, BtleRadio};
