//! Persistent work distribution over the path + lock layer.
//!
//! A multiplexer persists a finite item list once, then hands the items out
//! to cooperating workers, at most once each. The only shared state per
//! read session is a counter file, updated read-modify-write under the
//! path lock; workers may live in any process on any host that can reach
//! the control directory.
//!
//! Items are handed out in persisted order, but assignment races across
//! workers: no single worker sees a contiguous range, only the union over
//! all workers covers every index.

use chrono::Utc;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::upath::{LockTimeout, UPath};

pub const INFO_FILE: &str = "info.json";
pub const SESSIONS_DIR: &str = "sessions";
const NEXT_INDEX_FILE: &str = "next_index";
const FINISHED_FILE: &str = "finished";

#[derive(Serialize, Deserialize)]
struct MuxInfo<T> {
    n_items: usize,
    items: Vec<T>,
    created_at: String,
}

pub struct Multiplexer<T: Serialize + DeserializeOwned + Clone> {
    path: UPath,
    items: Vec<T>,
    lock_timeout: LockTimeout,
}

impl<T: Serialize + DeserializeOwned + Clone> Multiplexer<T> {
    /// Persist `items` as a new control directory at `path`. Fails with
    /// `AlreadyExists` if one is already there.
    pub fn new(items: Vec<T>, path: UPath) -> Result<Self> {
        let info = MuxInfo {
            n_items: items.len(),
            items,
            created_at: Utc::now().to_rfc3339(),
        };
        let data = serde_json::to_vec_pretty(&info)
            .map_err(|err| Error::Serde(format!("multiplexer info encode: {}", err)))?;
        path.joinpath(INFO_FILE).write_bytes(&data, false)?;
        debug!("created multiplexer at {} ({} items)", path, info.n_items);

        Ok(Multiplexer {
            path,
            items: info.items,
            lock_timeout: None,
        })
    }

    /// Open an existing control directory.
    pub fn open(path: UPath) -> Result<Self> {
        let data = path.joinpath(INFO_FILE).read_bytes()?;
        let info: MuxInfo<T> = serde_json::from_slice(&data)
            .map_err(|err| Error::CorruptManifest(format!("{}: {}", path, err)))?;
        if info.n_items != info.items.len() {
            return Err(Error::CorruptManifest(format!(
                "{}: n_items {} disagrees with {} stored items",
                path,
                info.n_items,
                info.items.len()
            )));
        }
        Ok(Multiplexer {
            path,
            items: info.items,
            lock_timeout: None,
        })
    }

    /// Timeout for the per-step counter lock. Default: block indefinitely.
    pub fn set_lock_timeout(&mut self, timeout: LockTimeout) {
        self.lock_timeout = timeout;
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    fn session_dir(&self, session_id: &str) -> UPath {
        self.path.joinpath(SESSIONS_DIR).joinpath(session_id)
    }

    fn counter_path(&self, session_id: &str) -> UPath {
        self.session_dir(session_id).joinpath(NEXT_INDEX_FILE)
    }

    /// Start a fresh read session and return its id.
    pub fn create_read_session(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.counter_path(&session_id).write_bytes(b"0", false)?;
        debug!("created session {} at {}", session_id, self.path);
        Ok(session_id)
    }

    /// Ids of all sessions ever created under this multiplexer.
    pub fn sessions(&self) -> Result<Vec<String>> {
        let dir = self.path.joinpath(SESSIONS_DIR);
        if !dir.is_dir()? {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for child in dir.iterdir()? {
            if let Some(name) = child.file_name() {
                ids.push(name);
            }
        }
        Ok(ids)
    }

    /// A worker-side iterator over the session. Each step claims the next
    /// unclaimed index under the counter lock.
    pub fn read_session(&self, session_id: &str) -> Result<MuxWorker<T>> {
        let counter = self.counter_path(session_id);
        if !counter.is_file()? {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        Ok(MuxWorker {
            items: self.items.clone(),
            counter,
            finished: self.session_dir(session_id).joinpath(FINISHED_FILE),
            lock_timeout: self.lock_timeout,
            exhausted: false,
        })
    }

    /// True once every item of the session has been claimed.
    pub fn done(&self, session_id: &str) -> Result<bool> {
        Ok(read_counter(&self.counter_path(session_id))? >= self.items.len())
    }

    /// Claim progress of a session: `(claimed, total)`.
    pub fn stat(&self, session_id: &str) -> Result<(usize, usize)> {
        let claimed = read_counter(&self.counter_path(session_id))?;
        Ok((claimed.min(self.items.len()), self.items.len()))
    }

    /// Remove the control directory and all session state.
    ///
    /// Not synchronized with running workers; coordinating shutdown is the
    /// caller's responsibility.
    pub fn destroy(self) -> Result<()> {
        self.path.remove_dir_recursive()
    }
}

fn read_counter(path: &UPath) -> Result<usize> {
    let data = path.read_bytes()?;
    let text = std::str::from_utf8(&data)
        .map_err(|err| Error::CorruptManifest(format!("{}: {}", path, err)))?;
    text.trim()
        .parse()
        .map_err(|err| Error::CorruptManifest(format!("{}: {}", path, err)))
}

/// One worker's view of a read session; yields `Result<T>`.
pub struct MuxWorker<T> {
    items: Vec<T>,
    counter: UPath,
    finished: UPath,
    lock_timeout: LockTimeout,
    exhausted: bool,
}

impl<T: Clone> MuxWorker<T> {
    fn claim(&mut self) -> Result<Option<T>> {
        let guard = self.counter.lock(self.lock_timeout)?;
        let next = read_counter(&self.counter)?;
        if next >= self.items.len() {
            drop(guard);
            self.exhausted = true;
            // first worker to observe exhaustion plants the sentinel
            match self.finished.write_bytes(b"", false) {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
            return Ok(None);
        }
        // a lapsed lease means a challenger may hold the lock by now
        guard.verify()?;
        self.counter
            .write_bytes(format!("{}", next + 1).as_bytes(), true)?;
        drop(guard);
        Ok(Some(self.items[next].clone()))
    }
}

impl<T: Clone> Iterator for MuxWorker<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.claim() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.exhausted = true;
                Some(Err(err))
            }
        }
    }
}
