//! Advisory file locks shared between processes.
//!
//! The lock lives on a sibling `<store>.lock` file so that the store itself
//! can be opened and reopened freely in append mode. `flock(2)` locks belong
//! to the open file description, so two handles opened in the same process
//! exclude each other just like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How hard to try before giving up on the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            retry_delay: Duration::from_millis(20),
        }
    }
}

/// Path of the lock file guarding `store`.
pub fn lock_path(store: &Path) -> PathBuf {
    let mut name = store.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Try to take the lock for `store`, retrying per `policy`.
    ///
    /// Returns `Ok(None)` if the lock stayed busy for every attempt.
    pub fn acquire(store: &Path, policy: LockPolicy) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(store))?;

        for attempt in 0..policy.attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(policy.retry_delay);
            }
            if try_flock(&file, libc::LOCK_EX | libc::LOCK_NB)? {
                return Ok(Some(FileLock { file }));
            }
        }

        Ok(None)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first
        // keeps the release point explicit.
        let _ = try_flock(&self.file, libc::LOCK_UN);
    }
}

/// Returns `Ok(false)` if the lock is held elsewhere.
fn try_flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EWOULDBLOCK => return Ok(false),
            _ => return Err(err),
        }
    }
}
