// Peer identity store - persists one stable identity per installation

use crate::{MeshError, PeerIdentity, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Fixed key under which the identity record is stored
const IDENTITY_KEY: &str = "peer-identity";

/// Preference file name inside the store directory
const PREFS_FILE: &str = "prefs.json";

/// File-backed preference store holding the local peer identity.
///
/// The first call to `get_or_create` generates an identity from the given
/// display name and persists it; every later call returns the persisted
/// identity regardless of the argument. A store that cannot be read or
/// written yields `MeshError::IdentityUnavailable`, which callers treat as
/// fatal at startup.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform default store directory
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("snapmesh"))
    }

    fn prefs_path(&self) -> PathBuf {
        self.dir.join(PREFS_FILE)
    }

    /// Return the persisted identity, creating and persisting one on first use.
    pub fn get_or_create(&self, display_name: &str) -> Result<PeerIdentity> {
        let mut prefs = self.load_prefs()?;

        if let Some(record) = prefs.get(IDENTITY_KEY) {
            let identity: PeerIdentity = serde_json::from_value(record.clone())
                .map_err(|e| MeshError::IdentityUnavailable(format!("corrupt record: {}", e)))?;
            debug!("Loaded persisted identity: {}", identity);
            return Ok(identity);
        }

        let identity = PeerIdentity::generate(display_name);
        prefs.insert(
            IDENTITY_KEY.to_string(),
            serde_json::to_value(&identity)
                .map_err(|e| MeshError::IdentityUnavailable(e.to_string()))?,
        );
        self.store_prefs(&prefs)?;

        info!("Created new identity: {}", identity);
        Ok(identity)
    }

    fn load_prefs(&self) -> Result<HashMap<String, Value>> {
        let path = self.prefs_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let bytes = fs::read(&path).map_err(|e| {
            MeshError::IdentityUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MeshError::IdentityUnavailable(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    fn store_prefs(&self, prefs: &HashMap<String, Value>) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            MeshError::IdentityUnavailable(format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        let path = self.prefs_path();
        let bytes = serde_json::to_vec_pretty(prefs)
            .map_err(|e| MeshError::IdentityUnavailable(e.to_string()))?;
        fs::write(&path, bytes).map_err(|e| {
            MeshError::IdentityUnavailable(format!("cannot write {}: {}", path.display(), e))
        })
    }
}
