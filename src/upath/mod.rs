//! Uniform path operations over local filesystems and blob stores.
//!
//! A [UPath] names either a local file (`/data/mystore/info.json`) or a key
//! inside a blob bucket (`gs://bucket/mystore/info.json`). Both variants
//! share one operation surface: byte-level read/write, listing, removal and
//! an exclusive advisory lock. Directories are not first class - they exist
//! exactly as long as at least one file has them as an ancestor.
//!
//! Writes are atomic: a reader either sees the previous content (or no file)
//! or the complete new content, never a torn write. With `overwrite=false`
//! the write additionally fails if the target already exists, which is the
//! primitive the store's create-once manifests and lock leases build on.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use rand::Rng;

use crate::error::{Error, Result};

pub mod blob;
pub mod local;
pub mod memory;

pub use blob::{BlobStore, LeaseConfig};
pub use memory::MemoryBlobStore;

/// How long a `lock()` call may wait. `None` blocks indefinitely,
/// `Some(Duration::ZERO)` fails immediately if the lock is held.
pub type LockTimeout = Option<Duration>;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

lazy_static! {
    static ref STORES: RwLock<HashMap<String, Arc<dyn BlobStore>>> = RwLock::new(HashMap::new());
}

/// Register a blob backend so that `UPath::parse` can resolve
/// `<scheme>://<bucket>/...` uris to it. Registering the same scheme and
/// bucket again replaces the previous backend.
pub fn register_store(store: Arc<dyn BlobStore>) {
    let key = format!("{}://{}", store.scheme(), store.bucket());
    STORES.write().unwrap().insert(key, store);
}

fn lookup_store(scheme: &str, bucket: &str) -> Result<Arc<dyn BlobStore>> {
    let key = format!("{}://{}", scheme, bucket);
    STORES
        .read()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("no blob backend registered for {}", key)))
}

/// A key inside a registered blob backend.
#[derive(Clone)]
pub struct BlobPath {
    store: Arc<dyn BlobStore>,
    key: String,
}

impl BlobPath {
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A location identifier, local or remote.
#[derive(Clone)]
pub enum UPath {
    Local(PathBuf),
    Blob(BlobPath),
}

impl fmt::Display for UPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UPath::Local(path) => write!(f, "{}", path.display()),
            UPath::Blob(blob) => write!(
                f,
                "{}://{}/{}",
                blob.store.scheme(),
                blob.store.bucket(),
                blob.key
            ),
        }
    }
}

impl fmt::Debug for UPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UPath({})", self)
    }
}

impl UPath {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        UPath::Local(path.into())
    }

    pub fn blob(store: Arc<dyn BlobStore>, key: impl Into<String>) -> Self {
        UPath::Blob(BlobPath {
            store,
            key: normalize_key(&key.into()),
        })
    }

    /// Parse a uri. `<scheme>://<bucket>/<key>` resolves through the
    /// backend registry; everything else is a local path.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((scheme, rest)) = s.split_once("://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::NotFound(format!("invalid blob uri '{}'", s)));
            }
            let store = lookup_store(scheme, bucket)?;
            Ok(UPath::blob(store, key))
        } else {
            Ok(UPath::Local(PathBuf::from(s)))
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, UPath::Local(_))
    }

    /// Join one or more `/`-separated segments; `.` and `..` collapse.
    pub fn joinpath(&self, segments: &str) -> UPath {
        match self {
            UPath::Local(path) => {
                let mut out = path.clone();
                for seg in segments.split('/') {
                    match seg {
                        "" | "." => {}
                        ".." => {
                            out.pop();
                        }
                        seg => out.push(seg),
                    }
                }
                UPath::Local(out)
            }
            UPath::Blob(blob) => {
                let joined = format!("{}/{}", blob.key, segments);
                UPath::Blob(BlobPath {
                    store: blob.store.clone(),
                    key: normalize_key(&joined),
                })
            }
        }
    }

    pub fn parent(&self) -> Option<UPath> {
        match self {
            UPath::Local(path) => path.parent().map(|p| UPath::Local(p.to_owned())),
            UPath::Blob(blob) => {
                if blob.key.is_empty() {
                    return None;
                }
                let parent = match blob.key.rsplit_once('/') {
                    Some((head, _)) => head.to_string(),
                    None => String::new(),
                };
                Some(UPath::Blob(BlobPath {
                    store: blob.store.clone(),
                    key: parent,
                }))
            }
        }
    }

    pub fn file_name(&self) -> Option<String> {
        match self {
            UPath::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            UPath::Blob(blob) => blob
                .key
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        }
    }

    /// The path relative to `base`, as a `/`-separated string.
    pub fn relative_to(&self, base: &UPath) -> Option<String> {
        let full = self.to_string();
        let prefix = base.to_string();
        let rest = full.strip_prefix(&prefix)?;
        Some(rest.trim_start_matches('/').to_string())
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match self {
            UPath::Local(path) => local::read_bytes(path),
            UPath::Blob(blob) => {
                with_retry("get", || blob.store.get(&blob.key))
            }
        }
    }

    /// Atomically write `data`. With `overwrite=false` the call fails with
    /// `AlreadyExists` if the target is present.
    pub fn write_bytes(&self, data: &[u8], overwrite: bool) -> Result<()> {
        match self {
            UPath::Local(path) => local::write_bytes(path, data, overwrite),
            UPath::Blob(blob) => {
                if overwrite {
                    with_retry("put", || blob.store.put(&blob.key, data, true))
                } else {
                    // A failed create-if-not-exists must not be retried
                    // blindly: the first attempt may have landed.
                    blob.store.put(&blob.key, data, false)
                }
            }
        }
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.is_file()? || self.is_dir()?)
    }

    pub fn is_file(&self) -> Result<bool> {
        match self {
            UPath::Local(path) => Ok(path.is_file()),
            UPath::Blob(blob) => with_retry("exists", || blob.store.exists(&blob.key)),
        }
    }

    pub fn is_dir(&self) -> Result<bool> {
        match self {
            UPath::Local(path) => Ok(path.is_dir()),
            UPath::Blob(blob) => {
                let prefix = dir_prefix(&blob.key);
                let keys = with_retry("list", || blob.store.list(&prefix))?;
                Ok(!keys.is_empty())
            }
        }
    }

    /// Immediate children. Blob "directories" are synthesized from the key
    /// space, so a child directory shows up as soon as any key lives under
    /// it.
    pub fn iterdir(&self) -> Result<Vec<UPath>> {
        match self {
            UPath::Local(path) => local::iterdir(path),
            UPath::Blob(blob) => {
                let prefix = dir_prefix(&blob.key);
                let keys = with_retry("list", || blob.store.list(&prefix))?;
                let mut children = BTreeSet::new();
                for key in keys {
                    if let Some(rest) = key.strip_prefix(&prefix) {
                        if let Some(first) = rest.split('/').next() {
                            if !first.is_empty() {
                                children.insert(first.to_string());
                            }
                        }
                    }
                }
                Ok(children.into_iter().map(|c| self.joinpath(&c)).collect())
            }
        }
    }

    /// Recursive listing, files only, sorted by path.
    pub fn riterdir(&self) -> Result<Vec<UPath>> {
        match self {
            UPath::Local(path) => local::riterdir(path),
            UPath::Blob(blob) => {
                let prefix = dir_prefix(&blob.key);
                let mut keys = with_retry("list", || blob.store.list(&prefix))?;
                keys.sort();
                Ok(keys
                    .into_iter()
                    .map(|key| {
                        UPath::Blob(BlobPath {
                            store: blob.store.clone(),
                            key,
                        })
                    })
                    .collect())
            }
        }
    }

    pub fn remove_file(&self) -> Result<()> {
        match self {
            UPath::Local(path) => local::remove_file(path),
            UPath::Blob(blob) => with_retry("delete", || blob.store.delete(&blob.key)),
        }
    }

    /// Remove every file below this path. Absent trees are not an error.
    pub fn remove_dir_recursive(&self) -> Result<()> {
        match self {
            UPath::Local(path) => local::remove_dir_recursive(path),
            UPath::Blob(blob) => {
                let prefix = dir_prefix(&blob.key);
                let keys = with_retry("list", || blob.store.list(&prefix))?;
                for key in keys {
                    with_retry("delete", || blob.store.delete(&key))?;
                }
                Ok(())
            }
        }
    }

    /// Acquire an exclusive advisory lock associated with this path.
    ///
    /// The lock is cross-process, and cross-host where the backend supports
    /// it. Local paths lock a `<name>.lock` sentinel via `flock`; blob paths
    /// use a lease blob with heartbeat refresh (see [blob::LeaseConfig]).
    /// The guard releases on drop, on every exit path.
    ///
    /// Re-entry by the same holder is not supported: locking a path twice
    /// from the same process blocks (local) or times out (blob).
    pub fn lock(&self, timeout: LockTimeout) -> Result<LockGuard> {
        match self {
            UPath::Local(path) => {
                let inner = local::LocalLock::acquire(path, timeout)?;
                Ok(LockGuard(GuardInner::Local(inner)))
            }
            UPath::Blob(blob) => {
                let inner = blob::BlobLease::acquire(
                    blob.store.clone(),
                    &blob.key,
                    timeout,
                    LeaseConfig::default(),
                )?;
                Ok(LockGuard(GuardInner::Blob(inner)))
            }
        }
    }
}

/// Scoped exclusive lock; dropping it releases the underlying lock.
pub struct LockGuard(GuardInner);

enum GuardInner {
    Local(local::LocalLock),
    Blob(blob::BlobLease),
}

impl LockGuard {
    /// Check that the lock is still held. Local flocks cannot lapse; a blob
    /// lease whose heartbeat observed a foreign holder reports `LockLost`.
    pub fn verify(&self) -> Result<()> {
        match &self.0 {
            GuardInner::Local(_) => Ok(()),
            GuardInner::Blob(lease) => lease.verify(),
        }
    }
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

fn normalize_key(key: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in key.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    parts.join("/")
}

/// Retry transient backend failures with bounded, jittered backoff.
pub(crate) fn with_retry<T, F>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, RETRY_ATTEMPTS, delay, err
                );
                std::thread::sleep(delay + Duration::from_millis(jitter));
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn joinpath_collapses_dot_segments() {
        let p = UPath::local("/data/store");
        assert_eq!(p.joinpath("a/./b").to_string(), "/data/store/a/b");
        assert_eq!(p.joinpath("a/../b").to_string(), "/data/store/b");
        assert_eq!(p.joinpath("../other").to_string(), "/data/other");
    }

    #[test]
    fn blob_uri_roundtrip() {
        let store = Arc::new(MemoryBlobStore::new("mem", "join-test"));
        register_store(store.clone());

        let p = UPath::parse("mem://join-test/stores/one").unwrap();
        assert_eq!(p.to_string(), "mem://join-test/stores/one");
        assert_eq!(p.joinpath("../two").to_string(), "mem://join-test/stores/two");
        assert_eq!(p.parent().unwrap().to_string(), "mem://join-test/stores");
        assert_eq!(p.file_name().unwrap(), "one");
    }

    #[test]
    fn unregistered_scheme_fails() {
        assert!(matches!(
            UPath::parse("nosuch://bucket/x"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn relative_to_strips_base() {
        let base = UPath::local("/data/store");
        let child = base.joinpath("store/a.json");
        assert_eq!(child.relative_to(&base).unwrap(), "store/a.json");
    }
}
