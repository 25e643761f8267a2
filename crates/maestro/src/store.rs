//! Key-file persistence of the known daemons.
//!
//! The file is a TOML document with one `[daemons."<address>"]` table per
//! daemon. It is rewritten in full on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use maestro_core::{Daemon, DaemonAddress};

use crate::error::StoreError;

/// Persisted record of one daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonEntry {
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,

    /// Identity accepted on the first handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
}

fn default_autoconnect() -> bool {
    true
}

impl From<&Daemon> for DaemonEntry {
    fn from(daemon: &Daemon) -> Self {
        Self {
            tags: daemon.tags().map(str::to_string).collect(),
            autoconnect: daemon.autoconnect,
            daemon_id: daemon.known_id.clone(),
        }
    }
}

impl DaemonEntry {
    /// Rebuild a DISCONNECTED daemon record.
    pub fn into_daemon(self, address: DaemonAddress) -> Daemon {
        let mut daemon = Daemon::new(address)
            .with_tags(self.tags)
            .with_autoconnect(self.autoconnect);
        daemon.known_id = self.daemon_id;
        daemon
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    daemons: BTreeMap<String, DaemonEntry>,
}

/// The key-file on disk.
#[derive(Debug, Clone)]
pub struct DaemonStore {
    path: PathBuf,
}

impl DaemonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every entry. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<DaemonAddress, DaemonEntry>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let file: KeyFile = toml::from_str(&text)?;
        Ok(file
            .daemons
            .into_iter()
            .map(|(address, entry)| (DaemonAddress::new(address), entry))
            .collect())
    }

    /// Rewrite the whole file.
    pub fn save<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a DaemonAddress, DaemonEntry)>,
    ) -> Result<(), StoreError> {
        let file = KeyFile {
            daemons: entries
                .into_iter()
                .map(|(address, entry)| (address.to_string(), entry))
                .collect(),
        };
        let text = toml::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), daemons = file.daemons.len(), "Key-file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = DaemonStore::new(temp_dir.path().join("servers.toml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = DaemonStore::new(temp_dir.path().join("conf/servers.toml"));

        let mut gpu = Daemon::new(DaemonAddress::new("gpu1:2127")).with_tags(["gpu", "big"]);
        gpu.known_id = Some("d-42".into());
        let batch = Daemon::new(DaemonAddress::new("batch:2127")).with_autoconnect(false);

        store
            .save([
                (&gpu.address, DaemonEntry::from(&gpu)),
                (&batch.address, DaemonEntry::from(&batch)),
            ])
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        let entry = &loaded[&DaemonAddress::new("gpu1:2127")];
        assert_eq!(entry.tags, vec!["big", "gpu"]);
        assert!(entry.autoconnect);
        assert_eq!(entry.daemon_id.as_deref(), Some("d-42"));
        assert!(!loaded[&DaemonAddress::new("batch:2127")].autoconnect);
    }

    #[test]
    fn test_entry_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers.toml");
        fs::write(&path, "[daemons.\"node1:2127\"]\n").unwrap();

        let loaded = DaemonStore::new(&path).load().unwrap();
        let daemon = loaded
            .into_iter()
            .next()
            .map(|(address, entry)| entry.into_daemon(address))
            .unwrap();
        assert!(daemon.autoconnect);
        assert_eq!(daemon.tags_string(), "");
        assert_eq!(daemon.known_id, None);
    }

    #[test]
    fn test_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers.toml");
        fs::write(&path, "daemons = [").unwrap();
        assert!(matches!(
            DaemonStore::new(&path).load(),
            Err(StoreError::Parse(_))
        ));
    }
}
