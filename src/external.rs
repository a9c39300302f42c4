//! Read a set of pre-existing columnar files as one logical sequence.
//!
//! The external data is never touched: discovery writes its result into the
//! store's *own* manifest under an independent directory, so the data root
//! may be read-only. Row order across files is the lexicographic order of
//! their paths relative to the root - stable and portable, independent of
//! any filesystem's iteration order.
//!
//! Files load at row-group granularity: one row group decodes into one
//! [BatchData], and iteration streams row groups through a bounded
//! prefetch channel.

use std::ops::Index;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use log::debug;
use once_cell::sync::OnceCell;
use parquet::file::reader::{FileReader as _, RowGroupReader as _, SerializedFileReader};
use parquet::schema::types::{Type as SchemaType, TypePtr};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::format::StorageFormat;
use crate::manifest::{ExternalInfo, FileEntry};
use crate::upath::UPath;

pub const INFO_FILE: &str = "info.json";

/// How many row groups the iterator decodes ahead of the consumer.
const PREFETCH: usize = 2;

/// One decoded row group: an in-memory sequence of rows.
///
/// Rows are JSON objects, except under a single-column projection where
/// each row is the bare column scalar.
#[derive(Debug, Clone, Default)]
pub struct BatchData {
    rows: Vec<Value>,
}

impl BatchData {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.rows.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Value> {
        self.rows
    }
}

impl Index<usize> for BatchData {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.rows[index]
    }
}

impl<'a> IntoIterator for &'a BatchData {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[derive(Clone)]
struct ParquetMeta {
    num_rows: usize,
    group_rows: Vec<usize>,
}

/// Lazy handle for one parquet file.
///
/// The raw bytes are fetched once and shared by every projection of the
/// file; row groups decode lazily and cache individually.
pub struct ParquetFileReader {
    path: UPath,
    projection: Option<Vec<String>>,
    raw: OnceCell<Bytes>,
    meta: OnceCell<ParquetMeta>,
    groups: OnceCell<Vec<OnceCell<BatchData>>>,
}

impl ParquetFileReader {
    pub fn new(path: UPath) -> Self {
        ParquetFileReader {
            path,
            projection: None,
            raw: OnceCell::new(),
            meta: OnceCell::new(),
            groups: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    /// The column projection, if any.
    pub fn projection(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    fn raw(&self) -> Result<&Bytes> {
        self.raw
            .get_or_try_init(|| self.path.read_bytes().map(Bytes::from))
    }

    fn open(&self) -> Result<SerializedFileReader<Bytes>> {
        SerializedFileReader::new(self.raw()?.clone())
            .map_err(|err| Error::corrupt_data(&self.path, err))
    }

    fn meta(&self) -> Result<&ParquetMeta> {
        self.meta.get_or_try_init(|| {
            let reader = self.open()?;
            let metadata = reader.metadata();
            let group_rows = (0..metadata.num_row_groups())
                .map(|i| metadata.row_group(i).num_rows() as usize)
                .collect();
            Ok(ParquetMeta {
                num_rows: metadata.file_metadata().num_rows() as usize,
                group_rows,
            })
        })
    }

    /// Row count, from the footer; the data pages stay untouched.
    pub fn len(&self) -> Result<usize> {
        Ok(self.meta()?.num_rows)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn num_row_groups(&self) -> Result<usize> {
        Ok(self.meta()?.group_rows.len())
    }

    /// Decode exactly one row group; idempotent per group.
    pub fn row_group(&self, index: usize) -> Result<&BatchData> {
        let meta = self.meta()?;
        let cells = self
            .groups
            .get_or_try_init(|| -> Result<Vec<OnceCell<BatchData>>> {
                Ok((0..meta.group_rows.len()).map(|_| OnceCell::new()).collect())
            })?;
        let cell = cells.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: meta.group_rows.len(),
        })?;
        cell.get_or_try_init(|| self.decode_group(index))
    }

    fn decode_group(&self, index: usize) -> Result<BatchData> {
        let reader = self.open()?;
        let projection = match &self.projection {
            Some(names) => Some(projected_schema(
                reader.metadata().file_metadata().schema(),
                names,
            )?),
            None => None,
        };
        let single = matches!(&self.projection, Some(names) if names.len() == 1);

        let group = reader
            .get_row_group(index)
            .map_err(|err| Error::corrupt_data(&self.path, err))?;
        let rows = group
            .get_row_iter(projection)
            .map_err(|err| Error::corrupt_data(&self.path, err))?;

        let mut out = Vec::new();
        for row in rows {
            let row = row.map_err(|err| Error::corrupt_data(&self.path, err))?;
            let value = row.to_json_value();
            if single {
                // a one-column projection yields the bare scalar, not a
                // single-key mapping
                match value {
                    Value::Object(map) => {
                        out.push(map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null))
                    }
                    other => out.push(other),
                }
            } else {
                out.push(value);
            }
        }
        Ok(BatchData { rows: out })
    }

    /// Random row access; decodes only the containing row group.
    pub fn get(&self, index: usize) -> Result<&Value> {
        let meta = self.meta()?;
        if index >= meta.num_rows {
            return Err(Error::IndexOutOfRange {
                index,
                len: meta.num_rows,
            });
        }
        let mut base = 0;
        for (group, &rows) in meta.group_rows.iter().enumerate() {
            if index < base + rows {
                return self.row_group(group)?.get(index - base).ok_or(
                    Error::IndexOutOfRange {
                        index: index - base,
                        len: rows,
                    },
                );
            }
            base += rows;
        }
        unreachable!("row counts cover num_rows");
    }

    /// Rows in file order, decoding row groups as they are reached.
    pub fn rows(&self) -> RowsIter<'_> {
        RowsIter {
            reader: self,
            group: 0,
            row: 0,
            failed: false,
        }
    }

    /// Re-batch the file into caller-sized [BatchData] chunks, decoding
    /// row groups as they are reached.
    pub fn iter_batches(&self, batch_size: usize) -> BatchIter<'_> {
        BatchIter {
            reader: self,
            next_row: 0,
            batch_size: batch_size.max(1),
            failed: false,
        }
    }

    /// A new reader restricted to the given columns, sharing this reader's
    /// raw bytes. Row access on a single-name projection yields scalars.
    pub fn columns(&self, names: &[&str]) -> ParquetFileReader {
        ParquetFileReader {
            path: self.path.clone(),
            projection: Some(names.iter().map(|n| n.to_string()).collect()),
            raw: self.raw.clone(),
            meta: self.meta.clone(),
            groups: OnceCell::new(),
        }
    }

    /// One whole column as an array of scalars.
    pub fn column(&self, name: &str) -> Result<Vec<Value>> {
        let projected = self.columns(&[name]);
        let mut out = Vec::with_capacity(projected.len()?);
        for group in 0..projected.num_row_groups()? {
            out.extend(projected.row_group(group)?.iter().cloned());
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ParquetFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParquetFileReader")
            .field("path", &self.path)
            .field("projection", &self.projection)
            .finish()
    }
}

pub struct RowsIter<'a> {
    reader: &'a ParquetFileReader,
    group: usize,
    row: usize,
    failed: bool,
}

impl<'a> Iterator for RowsIter<'a> {
    type Item = Result<&'a Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let groups = match self.reader.num_row_groups() {
                Ok(n) => n,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            if self.group >= groups {
                return None;
            }
            let batch = match self.reader.row_group(self.group) {
                Ok(batch) => batch,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            if let Some(value) = batch.get(self.row) {
                self.row += 1;
                return Some(Ok(value));
            }
            self.group += 1;
            self.row = 0;
        }
    }
}

pub struct BatchIter<'a> {
    reader: &'a ParquetFileReader,
    next_row: usize,
    batch_size: usize,
    failed: bool,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let total = match self.reader.len() {
            Ok(total) => total,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        if self.next_row >= total {
            return None;
        }
        let end = (self.next_row + self.batch_size).min(total);
        let mut rows = Vec::with_capacity(end - self.next_row);
        for index in self.next_row..end {
            match self.reader.get(index) {
                Ok(value) => rows.push(value.clone()),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        self.next_row = end;
        Some(Ok(BatchData { rows }))
    }
}

fn projected_schema(file_schema: &SchemaType, names: &[String]) -> Result<SchemaType> {
    let mut fields: Vec<TypePtr> = Vec::with_capacity(names.len());
    for name in names {
        let field = file_schema
            .get_fields()
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::NotFound(format!("column '{}' not in schema", name)))?;
        fields.push(field.clone());
    }
    SchemaType::group_type_builder(file_schema.name())
        .with_fields(fields)
        .build()
        .map_err(|err| Error::Serde(format!("projection schema: {}", err)))
}

/// A lazily loaded view over all columnar files under a data root.
pub struct ExternalBigList {
    path: UPath,
    data_root: UPath,
    format: StorageFormat,
    info: ExternalInfo,
    readers: Vec<ParquetFileReader>,
    cumulative: Vec<usize>,
}

impl ExternalBigList {
    /// Discover columnar files under `data_root` and persist the discovery
    /// as a new manifest at `path`. The data root itself is never written.
    pub fn new(path: UPath, data_root: UPath, format: StorageFormat) -> Result<Self> {
        check_format(format)?;
        let (entries, readers) = Self::scan(&data_root, format)?;

        let mut info = ExternalInfo::new(format, &data_root);
        info.data_files_info = entries;
        info.validate()?;
        info.create(&path.joinpath(INFO_FILE))?;
        debug!(
            "indexed {} external files under {} ({} rows)",
            readers.len(),
            data_root,
            info.total()
        );

        let cumulative = info.data_files_info.iter().map(|e| e.cumulative()).collect();
        Ok(ExternalBigList {
            path,
            data_root,
            format,
            info,
            readers,
            cumulative,
        })
    }

    /// Open a previously persisted discovery manifest.
    pub fn open(path: UPath) -> Result<Self> {
        let info = ExternalInfo::load(&path.joinpath(INFO_FILE))?;
        let format = info.format()?;
        check_format(format)?;
        let data_root = UPath::parse(&info.data_root)?;
        let readers = info
            .data_files_info
            .iter()
            .map(|entry| ParquetFileReader::new(data_root.joinpath(entry.path())))
            .collect();
        let cumulative = info.data_files_info.iter().map(|e| e.cumulative()).collect();

        Ok(ExternalBigList {
            path,
            data_root,
            format,
            info,
            readers,
            cumulative,
        })
    }

    fn scan(
        data_root: &UPath,
        format: StorageFormat,
    ) -> Result<(Vec<FileEntry>, Vec<ParquetFileReader>)> {
        let suffix = format!(".{}", format.extension());
        let mut relative: Vec<String> = data_root
            .riterdir()?
            .into_iter()
            .filter_map(|file| file.relative_to(data_root))
            .filter(|rel| rel.ends_with(&suffix))
            .collect();
        relative.sort();

        let mut entries = Vec::with_capacity(relative.len());
        let mut readers = Vec::with_capacity(relative.len());
        let mut running = 0usize;
        for rel in relative {
            let reader = ParquetFileReader::new(data_root.joinpath(&rel));
            let count = reader.len()?;
            running += count;
            entries.push(FileEntry(rel, count, running));
            readers.push(reader);
        }
        Ok((entries, readers))
    }

    /// Re-scan the data root and rewrite the discovery manifest.
    pub fn reload(&mut self) -> Result<()> {
        let (entries, readers) = Self::scan(&self.data_root, self.format)?;
        let mut info = ExternalInfo::new(self.format, &self.data_root);
        info.data_files_info = entries;
        info.validate()?;

        let info_path = self.path.joinpath(INFO_FILE);
        let guard = info_path.lock(None)?;
        guard.verify()?;
        info.store(&info_path)?;

        self.cumulative = info.data_files_info.iter().map(|e| e.cumulative()).collect();
        self.readers = readers;
        self.info = info;
        Ok(())
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn data_root(&self) -> &UPath {
        &self.data_root
    }

    pub fn storage_format(&self) -> StorageFormat {
        self.format
    }

    pub fn info(&self) -> &ExternalInfo {
        &self.info
    }

    pub fn len(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_files(&self) -> usize {
        self.readers.len()
    }

    /// The per-file readers, in sequence order.
    pub fn files(&self) -> &[ParquetFileReader] {
        &self.readers
    }

    /// Random row access; decodes one row group.
    pub fn get(&self, index: usize) -> Result<&Value> {
        if index >= self.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let file = self.cumulative.partition_point(|&c| c <= index);
        let base = if file == 0 { 0 } else { self.cumulative[file - 1] };
        self.readers[file].get(index - base)
    }

    /// Stream all rows in order, prefetching row groups ahead of the
    /// consumer on a background thread. Dropping the iterator cancels the
    /// prefetch.
    pub fn iter(&self) -> ExternalIter {
        let paths: Vec<UPath> = self.readers.iter().map(|r| r.path().clone()).collect();
        let (tx, rx) = bounded(PREFETCH);
        std::thread::Builder::new()
            .name("biglist-external-prefetch".to_string())
            .spawn(move || {
                for path in paths {
                    let reader = ParquetFileReader::new(path);
                    let groups = match reader.num_row_groups() {
                        Ok(n) => n,
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };
                    for group in 0..groups {
                        let batch = reader
                            .decode_group(group)
                            .map(BatchData::into_rows);
                        let failed = batch.is_err();
                        if tx.send(batch).is_err() {
                            debug!("external prefetch cancelled at {}", reader.path());
                            return;
                        }
                        if failed {
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn prefetch thread");

        ExternalIter {
            rx: Some(rx),
            current: Vec::new().into_iter(),
        }
    }

    /// Remove the discovery manifest (never the external data).
    pub fn destroy(self) -> Result<()> {
        self.path.remove_dir_recursive()
    }
}

/// Streaming row iterator; yields `Result<Value>`.
pub struct ExternalIter {
    rx: Option<Receiver<Result<Vec<Value>>>>,
    current: std::vec::IntoIter<Value>,
}

impl Iterator for ExternalIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }
            let rx = self.rx.as_ref()?;
            match rx.recv() {
                Ok(Ok(rows)) => {
                    self.current = rows.into_iter();
                }
                Ok(Err(err)) => {
                    self.rx = None;
                    return Some(Err(err));
                }
                Err(_) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

fn check_format(format: StorageFormat) -> Result<()> {
    if format != StorageFormat::Parquet {
        return Err(Error::Format(format!(
            "external stores read parquet; '{}' is not supported here",
            format.name()
        )));
    }
    Ok(())
}
