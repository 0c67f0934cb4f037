use std::{fs::File, path::Path};

use fs2::FileExt as _;
use log::debug;

use crate::error::Error;

pub const FILE_NAME: &str = "lock";

/// Exclusive advisory lock on a repository directory.
///
/// Held for the lifetime of the value and released on drop. The lock file
/// itself stays in place; only the advisory lock is dropped.
#[derive(Debug)]
pub struct Lock {
    file: File,
}

impl Lock {
    /// Acquire the lock, failing immediately if another process holds it.
    pub fn acquire(root: &Path) -> Result<Self, Error> {
        let path = root.join(FILE_NAME);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.try_lock_exclusive().map_err(Error::LockFailed)?;
        debug!("acquired lock {}", path.display());
        Ok(Self { file })
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
