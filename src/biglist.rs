//! The chunked, append-only list store.
//!
//! A store root holds `info.json` (the manifest) and a `store/` directory of
//! immutable data files. Appends accumulate in memory; a full buffer is
//! sealed into a uniquely named data file without any coordination, and
//! `flush` publishes the sealed files into the manifest under the manifest
//! lock. Many writers may hold the same root concurrently: data file names
//! never collide (timestamp + uuid), and only the manifest update contends.
//!
//! Readers trust the manifest alone. A writer that crashes after sealing a
//! data file but before publishing leaves an orphan, which stays invisible
//! until an offline [gc](BigList::gc) pass removes it.

use std::collections::HashSet;

use chrono::Utc;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::file_reader::FileReader;
use crate::file_seq::{FileSeq, SeqIter};
use crate::format::{FormatKind, StorageFormat};
use crate::manifest::StoreInfo;
use crate::upath::{LockTimeout, UPath};

pub const INFO_FILE: &str = "info.json";
pub const STORE_DIR: &str = "store";

pub struct BigList<T: Serialize + DeserializeOwned> {
    path: UPath,
    format: StorageFormat,
    info: StoreInfo,
    seq: FileSeq<T>,
    buffer: Vec<T>,
    /// Sealed data files not yet published into the manifest:
    /// `(relative_path, count)`.
    pending_files: Vec<(String, usize)>,
    lock_timeout: LockTimeout,
    temporary: bool,
    keep: bool,
    destroyed: bool,
}

impl<T: Serialize + DeserializeOwned> BigList<T> {
    /// Create a new store at `path`. Fails with `AlreadyExists` if a store
    /// (or anything else named `info.json`) is already there.
    pub fn new(path: UPath, batch_size: usize, format: StorageFormat) -> Result<Self> {
        if format.kind() == FormatKind::Columnar {
            return Err(Error::Format(format!(
                "'{}' is columnar; BigList writes row formats - use ExternalBigList for \
                 columnar data",
                format.name()
            )));
        }
        let info = StoreInfo::new(format, batch_size);
        info.validate()?;
        info.create(&path.joinpath(INFO_FILE))?;
        debug!("created biglist at {} (format {})", path, format.name());

        Ok(BigList {
            seq: FileSeq::new(Vec::new())?,
            path,
            format,
            info,
            buffer: Vec::with_capacity(batch_size),
            pending_files: Vec::new(),
            lock_timeout: None,
            temporary: false,
            keep: false,
            destroyed: false,
        })
    }

    /// Create a store under a unique temporary root. The root is removed
    /// when the owning handle drops, unless [persist](Self::persist) was
    /// called.
    pub fn new_temporary(batch_size: usize, format: StorageFormat) -> Result<Self> {
        let root = std::env::temp_dir().join(format!("biglist-{}", Uuid::new_v4()));
        let mut list = Self::new(UPath::local(root), batch_size, format)?;
        list.temporary = true;
        Ok(list)
    }

    /// Open an existing store.
    pub fn open(path: UPath) -> Result<Self> {
        let info = StoreInfo::load(&path.joinpath(INFO_FILE))?;
        let format = info.format()?;
        let seq = Self::build_seq(&path, format, &info)?;
        let batch_size = info.batch_size;

        Ok(BigList {
            path,
            format,
            info,
            seq,
            buffer: Vec::with_capacity(batch_size),
            pending_files: Vec::new(),
            lock_timeout: None,
            temporary: false,
            keep: false,
            destroyed: false,
        })
    }

    fn build_seq(path: &UPath, format: StorageFormat, info: &StoreInfo) -> Result<FileSeq<T>> {
        let readers = info
            .data_files_info
            .iter()
            .map(|entry| {
                FileReader::new(path.joinpath(entry.path()), format, Some(entry.count()))
            })
            .collect();
        FileSeq::new(readers)
    }

    /// Keep a temporary root on disk after the handle drops.
    pub fn persist(&mut self) {
        self.keep = true;
    }

    /// Timeout for the manifest lock during [flush](Self::flush).
    /// Default: block indefinitely.
    pub fn set_lock_timeout(&mut self, timeout: LockTimeout) {
        self.lock_timeout = timeout;
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn storage_format(&self) -> StorageFormat {
        self.format
    }

    pub fn batch_size(&self) -> usize {
        self.info.batch_size
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    /// Published element count. Buffered and pending elements become
    /// visible after [flush](Self::flush).
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements buffered in memory, not yet sealed into a data file.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The underlying file sequence; its handles ship to workers.
    pub fn files(&self) -> &FileSeq<T> {
        &self.seq
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        self.seq.get(index)
    }

    /// Append one element. A full buffer is sealed into a data file
    /// immediately; publication waits for [flush](Self::flush).
    pub fn append(&mut self, item: T) -> Result<()> {
        self.buffer.push(item);
        if self.buffer.len() >= self.info.batch_size {
            self.seal_buffer()?;
        }
        Ok(())
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) -> Result<()> {
        for item in items {
            self.append(item)?;
        }
        Ok(())
    }

    /// Seal the buffer into a uniquely named immutable data file. Needs no
    /// coordination: the timestamp orders files, the uuid makes the name
    /// globally unique under concurrent writers.
    fn seal_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let count = self.buffer.len();
        let name = format!(
            "{}_{}_{}.{}",
            Utc::now().format("%Y%m%d%H%M%S%.6f"),
            Uuid::new_v4(),
            count,
            self.format.extension()
        );
        let relative = format!("{}/{}", STORE_DIR, name);

        let bytes = self.format.encode_batch(&self.buffer)?;
        self.path.joinpath(&relative).write_bytes(&bytes, false)?;
        debug!("sealed {} elements into {}", count, relative);

        self.pending_files.push((relative, count));
        self.buffer.clear();
        Ok(())
    }

    /// Seal any partial tail batch and publish all sealed files into the
    /// manifest, under the manifest lock.
    ///
    /// On a failed manifest update the sealed files stay queued in memory
    /// and the error surfaces; a later `flush` retries the publication.
    pub fn flush(&mut self) -> Result<()> {
        self.seal_buffer()?;
        if self.pending_files.is_empty() {
            return Ok(());
        }

        let info_path = self.path.joinpath(INFO_FILE);
        let guard = info_path.lock(self.lock_timeout)?;

        // read-modify-write under the lock: other writers may have
        // published since our last load
        let mut info = StoreInfo::load(&info_path)?;
        info.push_files(&self.pending_files);
        // a lapsed lease means a challenger may hold the lock by now
        guard.verify()?;
        info.store(&info_path)?;

        debug!(
            "published {} data files at {} (total {})",
            self.pending_files.len(),
            self.path,
            info.total()
        );
        self.pending_files.clear();
        self.seq = Self::build_seq(&self.path, self.format, &info)?;
        self.info = info;
        Ok(())
    }

    /// Re-read the manifest to pick up files published by other writers.
    /// `len()` never decreases across successful reloads of a live store.
    pub fn reload(&mut self) -> Result<()> {
        let info = StoreInfo::load(&self.path.joinpath(INFO_FILE))?;
        self.seq = Self::build_seq(&self.path, self.format, &info)?;
        self.info = info;
        Ok(())
    }

    /// Stream all published elements in order, with prefetch.
    pub fn iter(&self) -> SeqIter<T>
    where
        T: Send + 'static,
    {
        self.seq.iter()
    }

    /// Data files present under `store/` but absent from the manifest.
    /// Orphans are left behind by writers that crashed between sealing and
    /// publishing; they are invisible to readers.
    pub fn orphan_files(&self) -> Result<Vec<UPath>> {
        let store_dir = self.path.joinpath(STORE_DIR);
        if !store_dir.is_dir()? {
            return Ok(Vec::new());
        }
        let published: HashSet<String> = self
            .info
            .data_files_info
            .iter()
            .map(|entry| entry.path().to_string())
            .collect();
        let pending: HashSet<&str> = self
            .pending_files
            .iter()
            .map(|(path, _)| path.as_str())
            .collect();

        let mut orphans = Vec::new();
        for file in store_dir.riterdir()? {
            if let Some(relative) = file.relative_to(&self.path) {
                if !published.contains(&relative) && !pending.contains(relative.as_str()) {
                    orphans.push(file);
                }
            }
        }
        Ok(orphans)
    }

    /// Remove orphan data files. Runs under the manifest lock and re-reads
    /// the manifest while holding it, so a file mid-publication is never
    /// removed. Returns the removed paths.
    pub fn gc(&mut self) -> Result<Vec<UPath>> {
        let info_path = self.path.joinpath(INFO_FILE);
        let guard = info_path.lock(self.lock_timeout)?;

        let info = StoreInfo::load(&info_path)?;
        self.seq = Self::build_seq(&self.path, self.format, &info)?;
        self.info = info;

        let orphans = self.orphan_files()?;
        guard.verify()?;
        for orphan in &orphans {
            warn!("removing orphan data file {}", orphan);
            orphan.remove_file()?;
        }
        Ok(orphans)
    }

    /// Remove the store root recursively, consuming the handle.
    ///
    /// Not synchronized with other processes holding this root open;
    /// coordinating shutdown is the caller's responsibility.
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        self.path.remove_dir_recursive()
    }
}

impl<T: Serialize + DeserializeOwned> Drop for BigList<T> {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if !self.buffer.is_empty() || !self.pending_files.is_empty() {
            if let Err(err) = self.flush() {
                warn!("flush on drop failed for {}: {}", self.path, err);
            }
        }
        if self.temporary && !self.keep {
            if let Err(err) = self.path.remove_dir_recursive() {
                warn!("failed to remove temporary root {}: {}", self.path, err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::DEFAULT_FORMAT;
    use tempfile::tempdir;

    fn new_list(root: &std::path::Path, batch_size: usize) -> BigList<i64> {
        BigList::new(UPath::local(root.join("mylist")), batch_size, DEFAULT_FORMAT).unwrap()
    }

    #[test]
    fn new_fails_on_existing_root() {
        let dir = tempdir().unwrap();
        let _list = new_list(dir.path(), 10);
        match BigList::<i64>::new(
            UPath::local(dir.path().join("mylist")),
            10,
            DEFAULT_FORMAT,
        ) {
            Err(Error::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn new_rejects_columnar_formats() {
        let dir = tempdir().unwrap();
        match BigList::<i64>::new(
            UPath::local(dir.path().join("x")),
            10,
            StorageFormat::Parquet,
        ) {
            Err(Error::Format(_)) => {}
            other => panic!("expected Format error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unflushed_elements_are_invisible() {
        let dir = tempdir().unwrap();
        let mut list = new_list(dir.path(), 10);

        for i in 0..25 {
            list.append(i).unwrap();
        }
        // two sealed batches, one buffered tail - nothing published yet
        assert_eq!(list.len(), 0);
        assert_eq!(list.buffered(), 5);

        list.flush().unwrap();
        assert_eq!(list.len(), 25);
        assert_eq!(list.buffered(), 0);
        assert_eq!(list.files().num_files(), 3);
        assert_eq!(list.files().counts(), vec![10, 10, 5]);
    }

    #[test]
    fn data_file_names_carry_count_and_extension() {
        let dir = tempdir().unwrap();
        let mut list = new_list(dir.path(), 4);
        list.extend(0..4).unwrap();
        list.flush().unwrap();

        let entry = &list.info().data_files_info[0];
        let name = entry.path().strip_prefix("store/").unwrap();
        assert!(name.ends_with("_4.pickle_zstd"), "unexpected name {}", name);
        // <UTC-timestamp-micros>_<uuid4>_<count>.<ext>
        let stem = name.rsplit_once('.').unwrap().0;
        let parts: Vec<&str> = stem.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), "20240101120000.000000".len());
        assert_eq!(parts[1].len(), 36);
        assert_eq!(parts[2], "4");
    }

    #[test]
    fn reload_picks_up_other_writers() {
        let dir = tempdir().unwrap();
        let mut writer = new_list(dir.path(), 5);
        let mut reader =
            BigList::<i64>::open(UPath::local(dir.path().join("mylist"))).unwrap();
        assert_eq!(reader.len(), 0);

        writer.extend(0..7).unwrap();
        writer.flush().unwrap();

        assert_eq!(reader.len(), 0);
        reader.reload().unwrap();
        assert_eq!(reader.len(), 7);
        assert_eq!(*reader.get(6).unwrap(), 6);
    }

    #[test]
    fn temporary_root_is_removed_on_drop() {
        let mut list = BigList::<i64>::new_temporary(10, DEFAULT_FORMAT).unwrap();
        list.extend(0..3).unwrap();
        let root = match list.path() {
            UPath::Local(p) => p.clone(),
            _ => unreachable!(),
        };
        assert!(root.join(INFO_FILE).exists());
        drop(list);
        assert!(!root.exists());
    }

    #[test]
    fn persisted_temporary_root_survives_drop() {
        let mut list = BigList::<i64>::new_temporary(10, DEFAULT_FORMAT).unwrap();
        list.persist();
        let root = match list.path() {
            UPath::Local(p) => p.clone(),
            _ => unreachable!(),
        };
        drop(list);
        assert!(root.join(INFO_FILE).exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn drop_flushes_buffered_elements() {
        let dir = tempdir().unwrap();
        let mut list = new_list(dir.path(), 100);
        list.extend(0..3).unwrap();
        drop(list);

        let reopened = BigList::<i64>::open(UPath::local(dir.path().join("mylist"))).unwrap();
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn works_on_memory_blob_backend() {
        use crate::upath::{register_store, MemoryBlobStore};
        use std::sync::Arc;

        register_store(Arc::new(MemoryBlobStore::new("mem", "biglist-unit")));
        let root = UPath::parse("mem://biglist-unit/stores/one").unwrap();

        let mut list = BigList::<i64>::new(root.clone(), 3, DEFAULT_FORMAT).unwrap();
        list.extend(0..10).unwrap();
        list.flush().unwrap();

        let reopened = BigList::<i64>::open(root).unwrap();
        assert_eq!(reopened.len(), 10);
        assert_eq!(reopened.files().num_files(), 4);
        let all: Vec<i64> = reopened.iter().map(|item| item.unwrap()).collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn destroy_removes_everything() {
        let dir = tempdir().unwrap();
        let mut list = new_list(dir.path(), 5);
        list.extend(0..12).unwrap();
        list.flush().unwrap();

        list.destroy().unwrap();
        assert!(!dir.path().join("mylist").exists());
    }
}
