// Beacon broadcaster - a simple on/off outward broadcast, independent of
// the peer session

use crate::radio::BeaconRadio;
use crate::{BeaconError, BeaconResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default measured power byte when none is configured (-59 dBm at 1 m)
const DEFAULT_MEASURED_POWER: i8 = -59;

/// Value object describing one outward broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconConfig {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub tx_power: Option<i8>,
}

impl BeaconConfig {
    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            major,
            minor,
            tx_power: None,
        }
    }

    /// Manufacturer frame in the proximity-beacon layout: type and length
    /// bytes, 16-byte UUID, big-endian major and minor, measured power.
    pub fn advertisement_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(23);
        frame.push(0x02);
        frame.push(0x15);
        frame.extend_from_slice(self.uuid.as_bytes());
        frame.extend_from_slice(&self.major.to_be_bytes());
        frame.extend_from_slice(&self.minor.to_be_bytes());
        frame.push(self.tx_power.unwrap_or(DEFAULT_MEASURED_POWER) as u8);
        frame
    }
}

/// Token describing the active broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconHandle {
    pub config: BeaconConfig,
}

/// Owns at most one outward broadcast; state is simply {off, on}.
pub struct BeaconBroadcaster {
    radio: Arc<dyn BeaconRadio>,
    active: RwLock<Option<BeaconHandle>>,
}

impl BeaconBroadcaster {
    pub fn new(radio: Arc<dyn BeaconRadio>) -> Self {
        Self {
            radio,
            active: RwLock::new(None),
        }
    }

    /// Start broadcasting. Fails with `Unavailable` when the radio is absent
    /// or powered off; the state then stays off and the failure is for the
    /// caller to report, not fatal.
    pub async fn start(&self, config: BeaconConfig) -> BeaconResult<BeaconHandle> {
        let mut active = self.active.write().await;
        if let Some(handle) = active.as_ref() {
            warn!("Beacon already broadcasting");
            return Ok(handle.clone());
        }

        if !self.radio.powered_on().await? {
            return Err(BeaconError::Unavailable("bluetooth not enabled".to_string()));
        }

        self.radio
            .start_advertising(&config.advertisement_frame())
            .await?;

        info!(
            "Beacon on: uuid={} major={} minor={}",
            config.uuid, config.major, config.minor
        );
        let handle = BeaconHandle { config };
        *active = Some(handle.clone());
        Ok(handle)
    }

    /// Release the broadcast. Idempotent, and safe to call even when
    /// broadcasting was never successfully started.
    pub async fn stop(&self) {
        let mut active = self.active.write().await;
        if active.take().is_none() {
            debug!("Beacon already off");
            return;
        }

        if let Err(e) = self.radio.stop_advertising().await {
            warn!("Failed to stop advertising cleanly: {}", e);
        }
        info!("Beacon off");
    }

    pub async fn is_broadcasting(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Handle of the active broadcast, if any.
    pub async fn current(&self) -> Option<BeaconHandle> {
        self.active.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_frame_layout() {
        let uuid = Uuid::parse_str("9CAB870B-8319-46F4-BBA6-F21F424A13E6").unwrap();
        let config = BeaconConfig {
            uuid,
            major: 100,
            minor: 1,
            tx_power: None,
        };

        let frame = config.advertisement_frame();
        assert_eq!(frame.len(), 23);
        assert_eq!(&frame[..2], &[0x02, 0x15]);
        assert_eq!(&frame[2..18], uuid.as_bytes());
        assert_eq!(&frame[18..20], &100u16.to_be_bytes());
        assert_eq!(&frame[20..22], &1u16.to_be_bytes());
        assert_eq!(frame[22], DEFAULT_MEASURED_POWER as u8);
    }

    #[test]
    fn test_advertisement_frame_uses_configured_power() {
        let config = BeaconConfig {
            uuid: Uuid::nil(),
            major: 1,
            minor: 2,
            tx_power: Some(-40),
        };
        let frame = config.advertisement_frame();
        assert_eq!(frame[22], (-40i8) as u8);
    }
}
