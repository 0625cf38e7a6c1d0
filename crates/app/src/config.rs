use mesh::IdentityStore;
use std::env;
use std::path::PathBuf;
use uuid::Uuid;

/// Default outward-broadcast identity, overridable via environment
const DEFAULT_BEACON_UUID: &str = "9CAB870B-8319-46F4-BBA6-F21F424A13E6";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Human name advertised to other peers
    pub display_name: String,
    /// Discovery filter subject; only peers with the same subject are joined
    pub subject: String,
    /// Directory holding the persisted identity
    pub data_dir: PathBuf,
    /// Directory received images are written to
    pub received_dir: PathBuf,
    pub beacon: BeaconSettings,
}

#[derive(Debug, Clone)]
pub struct BeaconSettings {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let display_name = env::var("SNAPMESH_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "snapmesh-user".to_string());

        let subject =
            env::var("SNAPMESH_SUBJECT").unwrap_or_else(|_| "snapmesh-demo".to_string());

        let data_dir = env::var("SNAPMESH_DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(IdentityStore::default_dir)
            .unwrap_or_else(|| PathBuf::from(".snapmesh"));

        let received_dir = env::var("SNAPMESH_RECEIVED_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("received"));

        let beacon = BeaconSettings {
            uuid: Uuid::parse_str(
                &env::var("SNAPMESH_BEACON_UUID")
                    .unwrap_or_else(|_| DEFAULT_BEACON_UUID.to_string()),
            )?,
            major: env::var("SNAPMESH_BEACON_MAJOR")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            minor: env::var("SNAPMESH_BEACON_MINOR")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
        };

        Ok(Self {
            display_name,
            subject,
            data_dir,
            received_dir,
            beacon,
        })
    }
}
