//! Local filesystem backend: atomic writes via a sibling temp file, advisory
//! locking via `flock` on a sentinel next to the target.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

use crate::error::{Error, Result};
use crate::upath::LockTimeout;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| Error::from_io(path, err))
}

/// Write `data` atomically. The bytes land in a `mkstemp` sibling under the
/// same directory first; publishing is a `rename` (overwrite) or a hard
/// `link` (no-overwrite, fails `EEXIST` atomically).
pub fn write_bytes(path: &Path, data: &[u8], overwrite: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| Error::from_io(parent, err))?;
    }

    // mkstemp works across processes, threads and hosts sharing the
    // directory; the sibling placement keeps the rename on one filesystem.
    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, tmp)) => (fd, tmp),
        Err(err) => return Err(Error::Backend(format!("mkstemp {:?} failed: {}", template, err))),
    };

    let mode = stat::Mode::S_IRUSR
        | stat::Mode::S_IWUSR
        | stat::Mode::S_IRGRP
        | stat::Mode::S_IROTH;
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        return Err(Error::Backend(format!("fchmod {:?} failed: {}", tmp_path, err)));
    }

    let mut file = unsafe { File::from_raw_fd(fd) };
    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        return Err(Error::Backend(format!("write {:?} failed: {}", tmp_path, err)));
    }
    drop(file);

    let publish = if overwrite {
        std::fs::rename(&tmp_path, path)
    } else {
        std::fs::hard_link(&tmp_path, path)
    };
    let result = publish.map_err(|err| Error::from_io(path, err));
    let _ = unistd::unlink(&tmp_path);
    result
}

pub fn iterdir(path: &Path) -> Result<Vec<crate::upath::UPath>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(path).map_err(|err| Error::from_io(path, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| Error::from_io(path, err))?;
        out.push(crate::upath::UPath::Local(entry.path()));
    }
    out.sort_by_key(|p| p.to_string());
    Ok(out)
}

pub fn riterdir(path: &Path) -> Result<Vec<crate::upath::UPath>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
        let entry =
            entry.map_err(|err| Error::Backend(format!("walk {}: {}", path.display(), err)))?;
        if entry.file_type().is_file() {
            out.push(crate::upath::UPath::Local(entry.into_path()));
        }
    }
    Ok(out)
}

pub fn remove_file(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|err| Error::from_io(path, err))
}

pub fn remove_dir_recursive(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(path).map_err(|err| Error::from_io(path, err))
}

/// Exclusive `flock` on a `<name>.lock` sentinel. The sentinel is never
/// unlinked - removing it while a challenger holds the old inode open would
/// let two holders coexist.
pub struct LocalLock {
    _file: File,
    path: PathBuf,
}

impl LocalLock {
    pub fn acquire(target: &Path, timeout: LockTimeout) -> Result<Self> {
        let path = sentinel_path(target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| Error::from_io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| Error::from_io(&path, err))?;
        let fd = file.as_raw_fd();

        match timeout {
            None => {
                flock(fd, FlockArg::LockExclusive).map_err(|err| {
                    Error::Backend(format!("flock {:?} failed: {}", path, err))
                })?;
            }
            Some(limit) => {
                let start = Instant::now();
                loop {
                    if flock(fd, FlockArg::LockExclusiveNonblock).is_ok() {
                        break;
                    }
                    if start.elapsed() >= limit {
                        return Err(Error::LockTimeout(path.display().to_string()));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL.min(limit));
                }
            }
        }

        Ok(LocalLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sentinel_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}
