//! Advisory lock on a vault's state directory.
//!
//! Uses flock() so at most one process maintains a vault's index.
//! - `serve`: acquires the lock on startup and holds it for its lifetime
//! - mutating CLI commands: acquire it for the duration of the command
//! - read-only CLI commands don't lock

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the vault's state directory
const LOCK_FILE_NAME: &str = "vaultd.lock";

/// A held vault lock that releases on drop
pub struct VaultLock {
    #[allow(dead_code)]
    file: File,
}

impl VaultLock {
    /// Attempt to lock the state directory without waiting.
    /// Fails with `WouldBlock` if another process holds it.
    pub fn try_acquire(state_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(state_dir)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(state_dir.join(LOCK_FILE_NAME))?;

        Self::try_lock_exclusive(&file)?;

        Ok(VaultLock { file })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "vault is locked by another vaultd process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no protection off unix
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for VaultLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
