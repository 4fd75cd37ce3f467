//! Persistence of counter and link state
//!
//! State lives in one small JSON document. Writes go to a sibling temporary
//! file that is synced and then renamed over the target, and the directory
//! is synced after the rename, so a crash or power loss leaves either the
//! old or the new document on disk. A missing or unreadable file
//! yields zeroed state instead of failing startup.

use crate::config::AddressType;
use crate::counters::ForwardCounter;
use crate::error::{BridgeError, Result};
use crate::logging::{StructuredLogger, get_logger};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistent state structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    /// Solar share on L1
    pub pv: ForwardCounter,

    /// Auxiliary meter on L2
    pub l2: ForwardCounter,

    /// Auxiliary meter on L3
    pub l3: ForwardCounter,

    /// Last address type that completed a round
    pub link_address_mode: Option<AddressType>,
}

/// Loads and atomically stores [`PersistentState`]
#[derive(Debug)]
pub struct PersistenceManager {
    file_path: PathBuf,
    logger: StructuredLogger,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            logger: get_logger("persistence"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Load state from disk, zero-initialising on any failure
    pub fn load(&self) -> PersistentState {
        match self.try_load() {
            Ok(Some(state)) => {
                self.logger.info(&format!(
                    "Loaded persistent state from {}",
                    self.file_path.display()
                ));
                state
            }
            Ok(None) => {
                self.logger
                    .info("No persistent state file found, starting from zero");
                PersistentState::default()
            }
            Err(e) => {
                self.logger.warn(&format!(
                    "Ignoring unreadable state file {}: {}",
                    self.file_path.display(),
                    e
                ));
                PersistentState::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<PersistentState>> {
        if !self.file_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.file_path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write state atomically: temp file in the same directory, synced,
    /// renamed over the target, then the directory entry synced
    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let dir = self
            .file_path
            .parent()
            .filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.tmp_path();
        let contents = serde_json::to_vec_pretty(state)?;
        if let Err(e) = write_synced(&tmp, &contents) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        std::fs::rename(&tmp, &self.file_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            BridgeError::io(format!(
                "Failed to replace {}: {}",
                self.file_path.display(),
                e
            ))
        })?;
        if let Err(e) = sync_dir(dir.unwrap_or_else(|| Path::new("."))) {
            // not every filesystem can sync a directory
            self.logger
                .debug(&format!("Directory sync after save failed: {}", e));
        }
        self.logger.debug("Saved persistent state to disk");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .file_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }
}

/// Write `contents` and flush them to the device before returning
fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_file_sits_next_to_target() {
        let mgr = PersistenceManager::new("/data/outback_spc/state.json");
        assert_eq!(
            mgr.tmp_path(),
            PathBuf::from("/data/outback_spc/state.json.tmp")
        );
    }

    #[test]
    fn save_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mgr = PersistenceManager::new(&path);
        let mut state = PersistentState::default();
        state.pv.lifetime_kwh = 1.5;
        mgr.save(&state).unwrap();
        assert!(path.exists());
        assert!(!mgr.tmp_path().exists());
        assert_eq!(mgr.load(), state);
    }

    #[test]
    fn save_replaces_previous_document_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mgr = PersistenceManager::new(&path);

        let mut state = PersistentState::default();
        state.pv.lifetime_kwh = 812.25;
        state.link_address_mode = Some(AddressType::Random);
        mgr.save(&state).unwrap();

        state.pv.lifetime_kwh = 812.5;
        state.l3.day_kwh = 0.75;
        mgr.save(&state).unwrap();

        let on_disk: PersistentState =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, state);
        assert!(!mgr.tmp_path().exists());
    }

    #[test]
    fn failed_write_leaves_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mgr = PersistenceManager::new(&path);
        let mut state = PersistentState::default();
        state.l2.lifetime_kwh = 3.0;
        mgr.save(&state).unwrap();

        // a directory squatting on the temp name makes the write fail
        std::fs::create_dir(mgr.tmp_path()).unwrap();
        state.l2.lifetime_kwh = 4.0;
        assert!(mgr.save(&state).is_err());
        assert_eq!(mgr.load().l2.lifetime_kwh, 3.0);
    }
}
