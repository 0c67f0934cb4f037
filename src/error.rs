use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{Key, SegmentId};

/// Error surface of the repository.
#[derive(Debug, Error)]
pub enum Error {
    /// The key has no live mapping, or a delete targeted an absent key.
    #[error("object {} does not exist", hex::encode(.0))]
    DoesNotExist(Key),
    /// An on-disk record failed checksum, tag or key validation during a
    /// normal read.
    ///
    /// The repository transitions to the check-required state when the
    /// caller rolls back; repair is never triggered implicitly.
    #[error("integrity error in segment {segment} at offset {offset}")]
    Integrity {
        segment: SegmentId,
        offset: u32,
        #[source]
        source: io::Error,
    },
    /// The repository has detected an inconsistency between the log and
    /// the index. All reads and writes refuse until a
    /// [`crate::Repository::check`] with `repair = true` succeeds.
    #[error("repository is inconsistent, check required")]
    CheckNeeded,
    /// Refused to create a repository over an existing, non-empty path.
    #[error("repository already exists at {}", .0.display())]
    AlreadyExists(PathBuf),
    /// The path does not contain a repository.
    #[error("{} is not a repository", .0.display())]
    NotARepository(PathBuf),
    /// Another process holds the repository lock.
    #[error("repository is locked by another process")]
    LockFailed(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A checksum mismatch was detected.
///
/// Usually wrapped in another error, such as [`io::Error`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;
