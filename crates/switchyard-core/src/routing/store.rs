//! Persistent storage for policy snapshots
//!
//! Each snapshot is one pretty-printed JSON file `<dir>/<name>.json` holding
//! the export time and the complete [`PolicyState`]. Writes go to a temporary
//! sibling first and are renamed into place, so readers never observe a
//! half-written snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::config::valid_snapshot_name;
use crate::error::{Error, Result};
use crate::policy::PolicyState;

/// A persisted policy state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the state was exported
    pub saved_at: DateTime<Utc>,
    /// The exported state
    pub state: PolicyState,
}

impl Snapshot {
    /// Wrap a state exported now
    pub fn new(state: PolicyState) -> Self {
        Self {
            saved_at: Utc::now(),
            state,
        }
    }

    /// Parse a snapshot file
    ///
    /// Bare exported states (without the envelope) are accepted too.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Snapshot>(bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(envelope_err) => match serde_json::from_slice::<PolicyState>(bytes) {
                Ok(state) => Ok(Self::new(state)),
                Err(_) => Err(Error::Serialization(envelope_err)),
            },
        }
    }

    /// Read a snapshot from an arbitrary path
    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).await?;
        Self::from_json(&bytes)
    }
}

/// Directory of named snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `dir`
    ///
    /// The directory is created on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a snapshot name maps to
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !valid_snapshot_name(name) {
            return Err(Error::InvalidArgument(format!(
                "snapshot name must be a plain file name: {}",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Persist a state under `name`, replacing any previous snapshot
    pub async fn save(&self, name: &str, state: &PolicyState) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir).await?;

        let snapshot = Snapshot {
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &path).await?;

        info!(
            name = %name,
            policy = %state.kind(),
            bytes = json.len(),
            "Saved policy snapshot"
        );
        Ok(path)
    }

    /// Load the snapshot stored under `name`, if any
    pub async fn load(&self, name: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                let snapshot = Snapshot::from_json(&bytes)?;
                debug!(name = %name, policy = %snapshot.state.kind(), "Loaded policy snapshot");
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all stored snapshots, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the snapshot stored under `name`
    ///
    /// Returns whether a snapshot existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
