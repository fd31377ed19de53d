use std::{ffi, fs, path, thread, time};

use crate::Result;

/// Exclusive writer lock, realised as a lock-directory on the backing
/// file system. Directory creation is atomic on every platform we care
/// about, whoever creates `lock/held/` owns the store for writing.
///
/// Readers never take this lock; they see a consistent snapshot by
/// resolving the pack-names index once at open.
pub struct LockDir {
    dir: ffi::OsString,
}

impl LockDir {
    pub fn new(repo_dir: &ffi::OsStr) -> LockDir {
        let dir: path::PathBuf = [repo_dir, ffi::OsStr::new("lock")].iter().collect();
        LockDir {
            dir: dir.into_os_string(),
        }
    }

    /// Take the write lock, retrying with backoff per the caller's
    /// policy. Fails with LockContention once attempts are exhausted.
    pub fn lock_write(&self, attempts: usize, backoff_ms: u64) -> Result<LockGuard> {
        let held: path::PathBuf = [self.dir.as_os_str(), ffi::OsStr::new("held")]
            .iter()
            .collect();
        err_at!(IOError, fs::create_dir_all(&self.dir))?;

        for attempt in 0..attempts {
            match fs::create_dir(&held) {
                Ok(()) => {
                    let info = held.join("info");
                    let data = format!("pid={}\n", std::process::id());
                    err_at!(IOError, fs::write(&info, data))?;
                    return Ok(LockGuard { held });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    log::warn!(
                        "lock {:?} held elsewhere, attempt {}/{}",
                        self.dir,
                        attempt + 1,
                        attempts
                    );
                    thread::sleep(time::Duration::from_millis(backoff_ms));
                }
                Err(err) => return err_at!(IOError, msg: "lock {:?}: {}", self.dir, err),
            }
        }
        err_at!(LockContention, msg: "{:?} after {} attempts", self.dir, attempts)
    }

    /// Forcibly remove a stale lock, for repair after a crashed writer.
    pub fn break_lock(&self) -> Result<()> {
        let held: path::PathBuf = [self.dir.as_os_str(), ffi::OsStr::new("held")]
            .iter()
            .collect();
        match fs::remove_dir_all(&held) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => err_at!(IOError, Err::<(), std::io::Error>(err)),
        }
    }

    pub fn is_held(&self) -> bool {
        let held: path::PathBuf = [self.dir.as_os_str(), ffi::OsStr::new("held")]
            .iter()
            .collect();
        held.exists()
    }
}

/// Held write lock, released on drop.
pub struct LockGuard {
    held: path::PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // a failed unlock leaves a stale lock for break_lock, nothing
        // more sensible can happen in a destructor.
        fs::remove_dir_all(&self.held).ok();
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod lock_test;
