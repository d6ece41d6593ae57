//! Persisted registry of every sandbox on disk, keyed by destination path.
//!
//! Every operation takes the catalog lock, re-reads the file, and (for
//! mutations) rewrites it in full through an atomic rename. No cached copy
//! is ever treated as authoritative.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::CatalogError;
use crate::fsutil::atomic_write_bytes;
use crate::lock::LockManager;

pub const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Z %Y";

/// Topology of a sandbox. Unknown names are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SandboxKind {
    #[default]
    Single,
    Multiple,
    MasterSlave,
    Group,
    FanIn,
    AllMasters,
    Ndb,
    Pxc,
    Other(String),
}

impl SandboxKind {
    pub fn as_str(&self) -> &str {
        match self {
            SandboxKind::Single => "single",
            SandboxKind::Multiple => "multiple",
            SandboxKind::MasterSlave => "master-slave",
            SandboxKind::Group => "group",
            SandboxKind::FanIn => "fan-in",
            SandboxKind::AllMasters => "all-masters",
            SandboxKind::Ndb => "ndb",
            SandboxKind::Pxc => "pxc",
            SandboxKind::Other(name) => name,
        }
    }

    pub fn is_multi_node(&self) -> bool {
        !matches!(self, SandboxKind::Single)
    }
}

impl From<String> for SandboxKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "single" => SandboxKind::Single,
            "multiple" => SandboxKind::Multiple,
            "master-slave" => SandboxKind::MasterSlave,
            "group" => SandboxKind::Group,
            "fan-in" => SandboxKind::FanIn,
            "all-masters" => SandboxKind::AllMasters,
            "ndb" => SandboxKind::Ndb,
            "pxc" => SandboxKind::Pxc,
            _ => SandboxKind::Other(value),
        }
    }
}

impl From<SandboxKind> for String {
    fn from(value: SandboxKind) -> Self {
        match value {
            SandboxKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub origin: String,
    #[serde(rename = "type", default)]
    pub kind: SandboxKind,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Position matches the node index in `nodes`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub port: Vec<u16>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub destination: String,
    #[serde(rename = "tool-version", default)]
    pub tool_version: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "log-directory", default, skip_serializing_if = "String::is_empty")]
    pub log_directory: String,
    #[serde(rename = "command-line", default)]
    pub command_line: String,
}

impl CatalogEntry {
    pub fn new(kind: SandboxKind, version: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind,
            version: version.into(),
            destination: destination.into(),
            ..Self::default()
        }
    }
}

/// Writers that encode an empty list as `null` are common; read it as empty.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

pub type Catalog = BTreeMap<String, CatalogEntry>;

/// File contents as loaded under the lock. Entries this version cannot
/// decode are carried through rewrites untouched.
#[derive(Debug, Default)]
struct Document {
    entries: Catalog,
    opaque: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
    locks: LockManager,
    enabled: bool,
    tool_version: String,
    command_line: String,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            path: path.into(),
            locks,
            enabled: true,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            command_line: String::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.catalog_path, LockManager::from_config(config))
            .with_enabled(config.catalog_enabled)
            .with_stamp(&config.tool_version, &config.command_line)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Values written into `tool-version` and `command-line` on update. An
    /// empty command line keeps whatever the entry carries.
    pub fn with_stamp(mut self, tool_version: &str, command_line: &str) -> Self {
        self.tool_version = tool_version.to_string();
        self.command_line = command_line.to_string();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn read(&self) -> Result<Catalog, CatalogError> {
        if !self.enabled {
            return Ok(Catalog::new());
        }
        let lock = self.locks.acquire("read catalog")?;
        let document = self.load();
        lock.release();
        Ok(document?.entries)
    }

    pub fn get(&self, key: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.read()?.remove(key))
    }

    pub fn keys(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.read()?.into_keys().collect())
    }

    /// Inserts or replaces `key`, stamping tool version, timestamp and
    /// command line. Returns the entry as written.
    pub fn update(&self, key: &str, entry: CatalogEntry) -> Result<CatalogEntry, CatalogError> {
        if !self.enabled {
            return Ok(entry);
        }
        let lock = self.locks.acquire(&format!("update {}", key))?;
        let mut document = self.load()?;
        let stamped = self.stamp(entry);
        document.opaque.remove(key);
        document.entries.insert(key.to_string(), stamped.clone());
        self.store(&document)?;
        lock.release();
        debug!(key, entries = document.entries.len(), "catalog entry written");
        Ok(stamped)
    }

    /// Removes `key`. Returns whether it was present; an absent key leaves
    /// the file untouched.
    pub fn delete(&self, key: &str) -> Result<bool, CatalogError> {
        if !self.enabled {
            return Ok(false);
        }
        let lock = self.locks.acquire(&format!("delete {}", key))?;
        let mut document = self.load()?;
        let removed = document.entries.remove(key).is_some() | document.opaque.remove(key).is_some();
        if removed {
            self.store(&document)?;
            debug!(key, entries = document.entries.len(), "catalog entry removed");
        }
        lock.release();
        Ok(removed)
    }

    fn stamp(&self, mut entry: CatalogEntry) -> CatalogEntry {
        entry.tool_version = self.tool_version.clone();
        entry.timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        if !self.command_line.is_empty() {
            entry.command_line = self.command_line.clone();
        }
        entry
    }

    /// Caller must hold the lock.
    fn load(&self) -> Result<Document, CatalogError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Document::default()),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.len() < 2 {
            return Ok(Document::default());
        }
        let raw = match serde_json::from_slice::<BTreeMap<String, Value>>(&bytes) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    err = %e,
                    "catalog file is not valid; treating it as empty"
                );
                return Ok(Document::default());
            }
        };
        let mut document = Document::default();
        for (key, value) in raw {
            match CatalogEntry::deserialize(&value) {
                Ok(entry) => {
                    document.entries.insert(key, entry);
                }
                Err(e) => {
                    warn!(key = %key, err = %e, "cannot decode catalog entry; keeping it as is");
                    document.opaque.insert(key, value);
                }
            }
        }
        Ok(document)
    }

    /// Caller must hold the lock.
    fn store(&self, document: &Document) -> Result<(), CatalogError> {
        let mut merged: BTreeMap<&str, Value> = document
            .opaque
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        for (key, entry) in &document.entries {
            merged.insert(key.as_str(), serde_json::to_value(entry)?);
        }
        let mut bytes = serde_json::to_vec_pretty(&merged)?;
        bytes.push(b'\n');
        atomic_write_bytes(&self.path, &bytes).map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
