//! Lazy handle for one immutable data file.
//!
//! A handle is a small value - path, format, cached count - plus an interior
//! once-initialized payload. The small prefix ([FileSpec]) serializes and
//! ships to worker processes; the receiver triggers I/O independently on
//! first access.

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::StorageFormat;
use crate::upath::UPath;

/// The shippable prefix of a [FileReader].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub format: String,
    pub count: Option<usize>,
}

pub struct FileReader<T> {
    path: UPath,
    format: StorageFormat,
    count: Option<usize>,
    payload: OnceCell<Vec<T>>,
}

impl<T: DeserializeOwned> FileReader<T> {
    pub fn new(path: UPath, format: StorageFormat, count: Option<usize>) -> Self {
        FileReader {
            path,
            format,
            count,
            payload: OnceCell::new(),
        }
    }

    pub fn from_spec(spec: &FileSpec) -> Result<Self> {
        Ok(FileReader {
            path: UPath::parse(&spec.path)?,
            format: spec.format.parse()?,
            count: spec.count,
            payload: OnceCell::new(),
        })
    }

    pub fn spec(&self) -> FileSpec {
        FileSpec {
            path: self.path.to_string(),
            format: self.format.name().to_string(),
            count: self.count,
        }
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    /// The count recorded at construction time, if any.
    pub fn count_hint(&self) -> Option<usize> {
        self.count
    }

    pub fn is_loaded(&self) -> bool {
        self.payload.get().is_some()
    }

    /// Element count. Answered from the cached count when available,
    /// otherwise the payload is decoded.
    pub fn len(&self) -> Result<usize> {
        match self.count {
            Some(count) => Ok(count),
            None => Ok(self.load()?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Decode the whole payload into memory; idempotent.
    pub fn load(&self) -> Result<&[T]> {
        let batch = self
            .payload
            .get_or_try_init(|| read_batch(&self.path, self.format, self.count))?;
        Ok(batch.as_slice())
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        let batch = self.load()?;
        batch.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: batch.len(),
        })
    }

    /// Elements in file order; loads on first call.
    pub fn iter(&self) -> Result<std::slice::Iter<'_, T>> {
        Ok(self.load()?.iter())
    }
}

impl<T> std::fmt::Debug for FileReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("format", &self.format.name())
            .field("count", &self.count)
            .field("loaded", &self.payload.get().is_some())
            .finish()
    }
}

/// Read and decode one data file, cross-checking a recorded count.
pub(crate) fn read_batch<T: DeserializeOwned>(
    path: &UPath,
    format: StorageFormat,
    expected: Option<usize>,
) -> Result<Vec<T>> {
    let data = path.read_bytes()?;
    let batch: Vec<T> = format
        .decode_batch(&data)
        .map_err(|err| Error::corrupt_data(path, err))?;
    if let Some(expected) = expected {
        if batch.len() != expected {
            return Err(Error::corrupt_data(
                path,
                format!("recorded count {} but decoded {}", expected, batch.len()),
            ));
        }
    }
    Ok(batch)
}
