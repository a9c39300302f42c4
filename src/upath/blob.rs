//! Blob storage interface and the lease-based lock built on it.
//!
//! Cloud bindings (GCS, S3, ...) live outside this crate; they plug in by
//! implementing [BlobStore] and registering through
//! [register_store](crate::upath::register_store). The contract the lock
//! layer depends on: `put` is a single atomic PUT, `put` with
//! `overwrite=false` is create-if-not-exists, and reads observe completed
//! writes (read-after-write consistency).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::upath::LockTimeout;

/// Uniform byte-level interface to one bucket of a blob service.
///
/// Keys are `/`-separated and never start or end with `/`. There is no
/// directory state: a "directory" exists exactly as long as `list` returns
/// a key under it.
pub trait BlobStore: Send + Sync {
    /// Uri scheme this backend serves, e.g. `gs`.
    fn scheme(&self) -> &str;

    /// Bucket name.
    fn bucket(&self) -> &str;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Atomic single-PUT write. With `overwrite=false` the backend must use
    /// its conditional-create primitive and fail with `AlreadyExists` if the
    /// key is present.
    fn put(&self, key: &str, data: &[u8], overwrite: bool) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// All keys with the given prefix (recursive, files only).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Lease parameters for the blob lock.
///
/// A holder refreshes its lease every `ttl / 3`; a challenger may break a
/// lease whose stamp is older than `ttl`. `poll_interval` paces the acquire
/// loop.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub poll_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    stamp: String,
}

impl LeaseRecord {
    fn new(holder: &str) -> Self {
        LeaseRecord {
            holder: holder.to_string(),
            stamp: Utc::now().to_rfc3339(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("lease record is always serializable")
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        match DateTime::parse_from_rfc3339(&self.stamp) {
            Ok(stamp) => {
                let age = Utc::now().signed_duration_since(stamp.with_timezone(&Utc));
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
            // an unreadable stamp is as good as an expired one
            Err(_) => true,
        }
    }
}

/// Exclusive lease on `<key>.lock`, refreshed by a heartbeat thread.
pub struct BlobLease {
    store: Arc<dyn BlobStore>,
    lock_key: String,
    holder: String,
    lost: Arc<AtomicBool>,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl BlobLease {
    pub fn acquire(
        store: Arc<dyn BlobStore>,
        key: &str,
        timeout: LockTimeout,
        config: LeaseConfig,
    ) -> Result<Self> {
        let lock_key = format!("{}.lock", key);
        let holder = Uuid::new_v4().to_string();
        let deadline = timeout.map(|limit| Instant::now() + limit);

        loop {
            match store.put(&lock_key, &LeaseRecord::new(&holder).encode(), false) {
                Ok(()) => break,
                Err(Error::AlreadyExists(_)) => {
                    if Self::try_break_stale(&store, &lock_key, &holder, config.ttl)? {
                        break;
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!("lease probe on {} failed: {}", lock_key, err);
                }
                Err(err) => return Err(err),
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout(lock_key));
                }
            }
            std::thread::sleep(config.poll_interval);
        }

        let lost = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let heartbeat = {
            let store = store.clone();
            let lock_key = lock_key.clone();
            let holder = holder.clone();
            let lost = lost.clone();
            let refresh = config.ttl / 3;
            std::thread::Builder::new()
                .name("biglist-lease".to_string())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(refresh) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let still_ours = match store.get(&lock_key) {
                        Ok(bytes) => serde_json::from_slice::<LeaseRecord>(&bytes)
                            .map(|rec| rec.holder == holder)
                            .unwrap_or(false),
                        Err(Error::NotFound(_)) => {
                            // lease blob vanished under us; re-assert
                            store
                                .put(&lock_key, &LeaseRecord::new(&holder).encode(), false)
                                .is_ok()
                        }
                        Err(err) => {
                            debug!("lease refresh read on {} failed: {}", lock_key, err);
                            continue;
                        }
                    };
                    if !still_ours {
                        warn!("lease on {} taken over by another holder", lock_key);
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    if let Err(err) =
                        store.put(&lock_key, &LeaseRecord::new(&holder).encode(), true)
                    {
                        debug!("lease refresh write on {} failed: {}", lock_key, err);
                    }
                })
                .map_err(|err| Error::Backend(format!("spawn lease heartbeat: {}", err)))?
        };

        Ok(BlobLease {
            store,
            lock_key,
            holder,
            lost,
            stop: Some(stop_tx),
            heartbeat: Some(heartbeat),
        })
    }

    /// Challenge a stale lease: overwrite it with our record, then read back
    /// to decide the race between concurrent challengers. Returns true if we
    /// now hold the lease.
    fn try_break_stale(
        store: &Arc<dyn BlobStore>,
        lock_key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let current = match store.get(lock_key) {
            Ok(bytes) => bytes,
            // released in between, next acquire round will create it
            Err(Error::NotFound(_)) => return Ok(false),
            Err(err) if err.is_transient() => return Ok(false),
            Err(err) => return Err(err),
        };
        let stale = serde_json::from_slice::<LeaseRecord>(&current)
            .map(|rec| rec.is_stale(ttl))
            .unwrap_or(true);
        if !stale {
            return Ok(false);
        }

        warn!("breaking stale lease on {}", lock_key);
        store.put(lock_key, &LeaseRecord::new(holder).encode(), true)?;
        let winner = store.get(lock_key)?;
        Ok(serde_json::from_slice::<LeaseRecord>(&winner)
            .map(|rec| rec.holder == holder)
            .unwrap_or(false))
    }

    pub fn verify(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(Error::LockLost(self.lock_key.clone()))
        } else {
            Ok(())
        }
    }
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.join();
        }
        if self.lost.load(Ordering::SeqCst) {
            return;
        }
        // delete only if the lease is still ours
        match self.store.get(&self.lock_key) {
            Ok(bytes) => {
                let ours = serde_json::from_slice::<LeaseRecord>(&bytes)
                    .map(|rec| rec.holder == self.holder)
                    .unwrap_or(false);
                if ours {
                    if let Err(err) = self.store.delete(&self.lock_key) {
                        warn!("failed to release lease on {}: {}", self.lock_key, err);
                    }
                }
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => warn!("failed to inspect lease on {}: {}", self.lock_key, err),
        }
    }
}
