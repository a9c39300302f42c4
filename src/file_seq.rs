//! An indexable, iterable sequence over a list of data file handles.
//!
//! Cumulative counts make indexed access O(log n); streaming iteration
//! decodes files on a background thread a fixed number of files ahead of
//! consumption, so decode overlaps with the consumer's work. Dropping the
//! iterator cancels the prefetcher.

use crossbeam_channel::{bounded, Receiver};
use log::debug;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::file_reader::{read_batch, FileReader};
use crate::format::StorageFormat;
use crate::upath::UPath;

/// How many files the iterator decodes ahead of the consumer.
const PREFETCH: usize = 2;

pub struct FileSeq<T> {
    readers: Vec<FileReader<T>>,
    cumulative: Vec<usize>,
}

impl<T: DeserializeOwned> FileSeq<T> {
    pub fn new(readers: Vec<FileReader<T>>) -> Result<Self> {
        let mut cumulative = Vec::with_capacity(readers.len());
        let mut running = 0usize;
        for reader in &readers {
            running += reader.len()?;
            cumulative.push(running);
        }
        Ok(FileSeq { readers, cumulative })
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

    /// Per-file element counts.
    pub fn counts(&self) -> Vec<usize> {
        let mut prev = 0;
        self.cumulative
            .iter()
            .map(|&c| {
                let n = c - prev;
                prev = c;
                n
            })
            .collect()
    }

    pub fn cumulative_counts(&self) -> &[usize] {
        &self.cumulative
    }

    pub fn readers(&self) -> &[FileReader<T>] {
        &self.readers
    }

    pub fn reader(&self, index: usize) -> Option<&FileReader<T>> {
        self.readers.get(index)
    }

    /// Map a global index to `(file_index, local_offset)`.
    pub fn locate(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let file = self.cumulative.partition_point(|&c| c <= index);
        let base = if file == 0 { 0 } else { self.cumulative[file - 1] };
        Ok((file, index - base))
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        let (file, offset) = self.locate(index)?;
        self.readers[file].get(offset)
    }
}

impl<T: DeserializeOwned + Send + 'static> FileSeq<T> {
    /// Stream all elements in order, prefetching [PREFETCH] files ahead.
    ///
    /// The prefetcher decodes from cold handles, so iteration does not pin
    /// every batch into this sequence's caches.
    pub fn iter(&self) -> SeqIter<T> {
        let sources: Vec<(UPath, StorageFormat, Option<usize>)> = self
            .readers
            .iter()
            .map(|r| (r.path().clone(), r.format(), r.count_hint()))
            .collect();
        SeqIter::spawn(sources)
    }
}

/// Streaming iterator with background prefetch; yields `Result<T>`.
pub struct SeqIter<T> {
    rx: Option<Receiver<Result<Vec<T>>>>,
    current: std::vec::IntoIter<T>,
}

impl<T: DeserializeOwned + Send + 'static> SeqIter<T> {
    pub(crate) fn spawn(sources: Vec<(UPath, StorageFormat, Option<usize>)>) -> Self {
        let (tx, rx) = bounded(PREFETCH);
        std::thread::Builder::new()
            .name("biglist-prefetch".to_string())
            .spawn(move || {
                for (path, format, count) in sources {
                    let batch = read_batch::<T>(&path, format, count);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() {
                        // receiver dropped: iteration abandoned
                        debug!("prefetch cancelled at {}", path);
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            })
            .expect("failed to spawn prefetch thread");

        SeqIter {
            rx: Some(rx),
            current: Vec::new().into_iter(),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> Iterator for SeqIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }
            let rx = self.rx.as_ref()?;
            match rx.recv() {
                Ok(Ok(batch)) => {
                    self.current = batch.into_iter();
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
