//! Content-addressed object repository with a transactional segment log.
//!
//! Objects are variable-sized binary blobs keyed by fixed-length, opaque
//! identifiers. All mutations are staged in an append-only log of numbered
//! segment files and become visible to future processes only once the
//! COMMIT record terminating the transaction has been flushed to stable
//! storage. A persistent index maps each live key to the segment and byte
//! offset of its authoritative PUT record; the index is derived state and
//! can always be rebuilt from the log.
//!
//! [`Repository`] is the transaction coordinator and the main entry point.
//! [`Repository::check`] validates a repository against the log and, in
//! repair mode, reconstructs a consistent state from a truncated or
//! corrupted one.

mod check;
mod config;
mod index;
mod lock;
mod record;
mod repo;
mod repository;
mod segment;

pub use crate::repository::Repository;
pub mod error;
pub use crate::error::Error;

/// Object identifier: 32 bytes, opaque to the repository.
///
/// Higher layers derive keys by hashing object contents; the repository
/// only ever compares them for byte equality.
pub type Key = [u8; 32];

/// Identifier of a segment file.
pub type SegmentId = u32;

/// Location of a stored record: the segment it lives in and the byte
/// offset of the record within that segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot {
    pub segment: SegmentId,
    pub offset: u32,
}

/// Repository options, fixed at creation time and persisted in the
/// `config` file. Opening an existing repository ignores this and uses
/// the persisted values.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Soft bound on segment file size. A transaction whose writes grow
    /// the current segment past this continues in the next segment; the
    /// COMMIT at the end covers all of them.
    ///
    /// Default: 5 MiB
    pub max_segment_size: u64,
    /// Directory fan-out: segment `id` is stored under
    /// `data/<id / segments_per_dir>`.
    ///
    /// Default: 10,000
    pub segments_per_dir: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_segment_size: 5 * 1024 * 1024,
            segments_per_dir: 10_000,
        }
    }
}

/// The operation set shared by repository implementations.
///
/// [`Repository`] is the local, on-disk implementation. A remote client
/// tunneling the same operations over a byte stream plugs in here and
/// must preserve all behavioral contracts, including error identity.
pub trait Store {
    /// Store `data` under `key`, replacing any previous object.
    fn put(&mut self, key: &Key, data: &[u8]) -> Result<(), Error>;
    /// Retrieve the object stored under `key`.
    fn get(&mut self, key: &Key) -> Result<Vec<u8>, Error>;
    /// Remove the object stored under `key`.
    fn delete(&mut self, key: &Key) -> Result<(), Error>;
    /// Make all staged operations durable.
    fn commit(&mut self) -> Result<(), Error>;
    /// Discard all staged operations.
    fn rollback(&mut self) -> Result<(), Error>;
    /// Validate the repository; with `repair`, restore consistency.
    ///
    /// Returns `true` iff the repository is (now) self-consistent.
    fn check(&mut self, repair: bool) -> Result<bool, Error>;
    /// The committed key set, in unspecified order.
    fn keys(&mut self) -> Result<Vec<Key>, Error>;
}
