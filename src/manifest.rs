//! The info manifest - the authoritative record of a store's data files.
//!
//! Readers trust the manifest, never directory listings: a data file exists
//! for a reader exactly when the manifest names it. This decouples read
//! consistency from eventually-consistent blob listings and makes writer
//! crashes harmless (an unpublished data file is merely an orphan).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::StorageFormat;
use crate::upath::UPath;

/// On-disk manifest schema version.
pub const STORAGE_VERSION: u32 = 3;

/// One data file entry: `[relative_path, count, cumulative_count]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry(pub String, pub usize, pub usize);

impl FileEntry {
    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn count(&self) -> usize {
        self.1
    }

    pub fn cumulative(&self) -> usize {
        self.2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub storage_format: String,
    pub storage_version: u32,
    pub batch_size: usize,
    pub data_files_info: Vec<FileEntry>,
    /// Extension metadata: element schema hints, user tags.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl StoreInfo {
    pub fn new(format: StorageFormat, batch_size: usize) -> Self {
        StoreInfo {
            storage_format: format.name().to_string(),
            storage_version: STORAGE_VERSION,
            batch_size,
            data_files_info: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn format(&self) -> Result<StorageFormat> {
        self.storage_format.parse()
    }

    /// Total element count over all published files.
    pub fn total(&self) -> usize {
        self.data_files_info.last().map(|e| e.cumulative()).unwrap_or(0)
    }

    pub fn cumulative_counts(&self) -> Vec<usize> {
        self.data_files_info.iter().map(|e| e.cumulative()).collect()
    }

    /// Append newly published data files, extending the running totals.
    pub fn push_files(&mut self, entries: &[(String, usize)]) {
        let mut cumulative = self.total();
        for (path, count) in entries {
            cumulative += count;
            self.data_files_info
                .push(FileEntry(path.clone(), *count, cumulative));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::CorruptManifest("batch_size must be positive".into()));
        }
        self.format()?;
        validate_entries(&self.data_files_info)
    }

    pub fn load(path: &UPath) -> Result<Self> {
        let info: StoreInfo = read_json(path)?;
        info.validate()?;
        Ok(info)
    }

    /// Atomically replace the manifest. Callers serialize via `path.lock()`.
    pub fn store(&self, path: &UPath) -> Result<()> {
        write_json(path, self, true)
    }

    /// Publish a brand-new manifest; fails `AlreadyExists` on a live root.
    pub fn create(&self, path: &UPath) -> Result<()> {
        write_json(path, self, false)
    }
}

/// Manifest of an [ExternalBigList](crate::external::ExternalBigList):
/// the persisted result of discovering columnar files under a read-only
/// data root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalInfo {
    pub storage_format: String,
    pub storage_version: u32,
    pub data_root: String,
    pub data_files_info: Vec<FileEntry>,
}

impl ExternalInfo {
    pub fn new(format: StorageFormat, data_root: &UPath) -> Self {
        ExternalInfo {
            storage_format: format.name().to_string(),
            storage_version: STORAGE_VERSION,
            data_root: data_root.to_string(),
            data_files_info: Vec::new(),
        }
    }

    pub fn format(&self) -> Result<StorageFormat> {
        self.storage_format.parse()
    }

    pub fn total(&self) -> usize {
        self.data_files_info.last().map(|e| e.cumulative()).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        let format = self.format()?;
        if !format.is_columnar() {
            return Err(Error::CorruptManifest(format!(
                "external manifest with row format '{}'",
                self.storage_format
            )));
        }
        validate_entries(&self.data_files_info)
    }

    pub fn load(path: &UPath) -> Result<Self> {
        let info: ExternalInfo = read_json(path)?;
        info.validate()?;
        Ok(info)
    }

    pub fn store(&self, path: &UPath) -> Result<()> {
        write_json(path, self, true)
    }

    pub fn create(&self, path: &UPath) -> Result<()> {
        write_json(path, self, false)
    }
}

fn validate_entries(entries: &[FileEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut running = 0usize;
    for entry in entries {
        if !seen.insert(entry.path()) {
            return Err(Error::CorruptManifest(format!(
                "duplicate data file '{}'",
                entry.path()
            )));
        }
        running += entry.count();
        if entry.cumulative() != running {
            return Err(Error::CorruptManifest(format!(
                "cumulative count mismatch at '{}': recorded {}, running sum {}",
                entry.path(),
                entry.cumulative(),
                running
            )));
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &UPath) -> Result<T> {
    let data = path.read_bytes()?;
    serde_json::from_slice(&data)
        .map_err(|err| Error::CorruptManifest(format!("{}: {}", path, err)))
}

fn write_json<T: Serialize>(path: &UPath, value: &T, overwrite: bool) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| Error::Serde(format!("manifest encode: {}", err)))?;
    path.write_bytes(&data, overwrite)
}
