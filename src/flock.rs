//! Exclusive lock on a tablet directory.
//!
//! Two tablets opened on the same directory would both replay and append to the
//! same metadata log. The lock file holds an advisory `flock` for as long as
//! the tablet is open; the OS releases it when the file is closed, including
//! when the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

pub const LOCK_FILE_NAME: &str = "LOCK";

#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `<dir>/LOCK`. Fails with `IllegalState` if another holder has it.
    pub fn lock_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = Self::try_lock(&file) {
            return Err(match err.kind() {
                io::ErrorKind::WouldBlock => Error::IllegalState(format!(
                    "tablet directory {} is locked by another process",
                    dir.display()
                )),
                _ => err.into(),
            });
        }

        // Owner pid, for humans.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
