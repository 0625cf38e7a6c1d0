use async_trait::async_trait;
use beacon::{BeaconBroadcaster, BeaconConfig, BeaconError, BeaconRadio, BeaconResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct MockRadio {
    powered: AtomicBool,
    advertising: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockRadio {
    fn powered_on() -> Self {
        let radio = Self::default();
        radio.powered.store(true, Ordering::SeqCst);
        radio
    }
}

#[async_trait]
impl BeaconRadio for MockRadio {
    async fn powered_on(&self) -> BeaconResult<bool> {
        Ok(self.powered.load(Ordering::SeqCst))
    }

    async fn start_advertising(&self, _frame: &[u8]) -> BeaconResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> BeaconResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn demo_config() -> BeaconConfig {
    BeaconConfig::new(
        Uuid::parse_str("9CAB870B-8319-46F4-BBA6-F21F424A13E6").unwrap(),
        100,
        1,
    )
}

#[tokio::test]
async fn test_start_broadcasting() {
    let radio = Arc::new(MockRadio::powered_on());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    let handle = broadcaster.start(demo_config()).await.unwrap();
    assert_eq!(handle.config, demo_config());
    assert!(broadcaster.is_broadcasting().await);
    assert_eq!(radio.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_with_radio_off_fails_and_stays_off() {
    let radio = Arc::new(MockRadio::default());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    let result = broadcaster.start(demo_config()).await;
    assert!(matches!(result, Err(BeaconError::Unavailable(_))));
    assert!(!broadcaster.is_broadcasting().await);
    assert_eq!(radio.start_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_without_start_is_safe() {
    let radio = Arc::new(MockRadio::powered_on());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    broadcaster.stop().await;
    assert!(!broadcaster.is_broadcasting().await);
    assert_eq!(radio.stop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let radio = Arc::new(MockRadio::powered_on());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    broadcaster.start(demo_config()).await.unwrap();
    broadcaster.stop().await;
    broadcaster.stop().await;

    assert!(!broadcaster.is_broadcasting().await);
    assert_eq!(radio.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_double_start_returns_existing_handle() {
    let radio = Arc::new(MockRadio::powered_on());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    let first = broadcaster.start(demo_config()).await.unwrap();
    let mut other = demo_config();
    other.major = 200;
    let second = broadcaster.start(other).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(radio.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_toggle_cycle() {
    let radio = Arc::new(MockRadio::powered_on());
    let broadcaster = BeaconBroadcaster::new(radio.clone());

    broadcaster.start(demo_config()).await.unwrap();
    assert!(broadcaster.is_broadcasting().await);
    assert!(broadcaster.current().await.is_some());

    broadcaster.stop().await;
    assert!(!broadcaster.is_broadcasting().await);
    assert!(broadcaster.current().await.is_none());

    broadcaster.start(demo_config()).await.unwrap();
    assert!(broadcaster.is_broadcasting().await);
    assert_eq!(radio.start_calls.load(Ordering::SeqCst), 2);
}
