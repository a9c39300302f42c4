//! This crate implements a chunked, append-only, distributed list store.
//!
//! # Data layout
//!
//! A [BigList] serializes its elements into many immutable data files under
//! one root directory, which may live on a local filesystem or on a blob
//! service (see [UPath]):
//!
//! ```text
//! <root>/
//!   info.json                the manifest
//!   store/
//!     <ts>_<uuid>_<n>.<ext>  one sealed batch each
//! ```
//!
//! The manifest is the authoritative list of data files and their element
//! counts; its running totals give O(log n) random access over the logical
//! concatenation of all files. Data files are write-once: a batch of
//! elements is serialized through the [format] registry, sealed under a
//! globally unique name (creation timestamp + uuid4 + count) and never
//! touched again.
//!
//! An [ExternalBigList] presents pre-existing parquet files under a
//! read-only root as the same kind of sequence, lazily loaded at row-group
//! granularity, and the [Multiplexer] hands the elements of any persisted
//! item list out to cooperating workers at most once each.
//!
//! # Locking
//!
//! Concurrent writers need no coordination to create data files - names
//! cannot collide. The only contended objects are the manifest and the
//! multiplexer's per-session counter, both updated read-modify-write under
//! [UPath::lock]: an exclusive advisory lock realized as `flock` on a
//! sentinel file locally and as a heartbeat-refreshed lease blob on blob
//! storage. Guards release on drop, on every exit path.
//!
//! # Crash model
//!
//! Every publish is an atomic write (temp sibling + rename locally, single
//! PUT remotely), so readers never observe torn state. A writer that dies
//! between sealing a data file and updating the manifest leaves an orphan
//! file that readers never see; [BigList::orphan_files] finds such files
//! and [BigList::gc] removes them offline. Once a reader has seen a file
//! in the manifest it stays there: `len()` never decreases across reloads
//! of a live store.

pub mod biglist;
pub mod error;
pub mod external;
pub mod file_reader;
pub mod file_seq;
pub mod format;
pub mod manifest;
pub mod multiplexer;
pub mod upath;

pub use biglist::BigList;
pub use error::{Error, Result};
pub use external::{BatchData, ExternalBigList, ParquetFileReader};
pub use file_reader::{FileReader, FileSpec};
pub use file_seq::{FileSeq, SeqIter};
pub use format::{FormatKind, StorageFormat, DEFAULT_FORMAT};
pub use manifest::{ExternalInfo, FileEntry, StoreInfo, STORAGE_VERSION};
pub use multiplexer::{Multiplexer, MuxWorker};
pub use upath::{register_store, BlobStore, LeaseConfig, LockGuard, MemoryBlobStore, UPath};
