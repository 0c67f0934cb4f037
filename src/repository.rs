//! The transaction coordinator.
//!
//! A [`Repository`] owns the segment log, the persistent index and the
//! exclusive lock. Mutations are staged in segments above the newest
//! committed one and tracked in an in-memory overlay; `commit` seals them
//! with a COMMIT record and replaces the index snapshot, `rollback`
//! deletes them again. The committed snapshot is loaded lazily and
//! revalidated against the log after every transaction boundary, so
//! inconsistencies introduced behind our back surface as
//! [`Error::CheckNeeded`] instead of silently wrong reads.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Seek as _, SeekFrom},
    mem,
    path::PathBuf,
};

use log::{debug, info, warn};

use crate::{
    check,
    config::{self, Config},
    error::Error,
    index::{self, Index},
    lock::Lock,
    record::{Record, MAX_OBJECT_SIZE},
    repo::{self, fs::sync_dir, Fs, Repo as _},
    segment::{self, FileLike as _},
    Key, Options, SegmentId, Slot, Store,
};

/// Committed state, loaded lazily from the newest index file.
///
/// Dropped by `commit` and `rollback` so every transaction starts from a
/// validated view of the disk.
#[derive(Debug)]
struct Loaded {
    /// Id of the newest committed segment; `None` in an empty repository.
    committed: Option<SegmentId>,
    index: Index,
}

/// The segments being written by the open transaction.
#[derive(Debug)]
struct Txn {
    writer: segment::Writer<File>,
    /// The segment currently written to.
    segment: SegmentId,
    /// Every segment this transaction created, oldest first.
    created: Vec<SegmentId>,
}

impl Txn {
    /// Append `record`, rotating into the next segment when the current
    /// one is full. Rotation writes no COMMIT; the single COMMIT at the
    /// end of the transaction covers all rotated segments.
    fn append(&mut self, segments: &Fs, max_segment_size: u64, record: &Record) -> io::Result<Slot> {
        if !self.writer.is_empty()
            && self.writer.len() + record.encoded_len() as u64 > max_segment_size
        {
            debug!(
                "segment {} is full, transaction continues in {}",
                self.segment,
                self.segment + 1
            );
            self.writer.fsync()?;
            let next = self.segment + 1;
            self.writer = repo::create_segment_writer(segments, next)?;
            self.segment = next;
            self.created.push(next);
        }

        let offset = self.writer.append(record)?;
        let offset = u32::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "segment offset overflow"))?;
        Ok(Slot {
            segment: self.segment,
            offset,
        })
    }
}

/// A content-addressed object repository on the local filesystem.
pub struct Repository {
    root: PathBuf,
    config: Config,
    segments: Fs,
    _lock: Lock,
    loaded: Option<Loaded>,
    /// Staged operations of the open transaction; `None` marks a pending
    /// delete.
    delta: HashMap<Key, Option<Slot>>,
    txn: Option<Txn>,
    /// All reads and writes refuse until a successful repair.
    check_needed: bool,
    /// An integrity error was observed; promoted to `check_needed` when
    /// the caller rolls back.
    tainted: bool,
}

impl Repository {
    /// Open the repository at `root`, acquiring its exclusive lock.
    ///
    /// The lock is taken before anything else is read; only the
    /// existence of the directory itself is probed first, since the
    /// lock file lives inside it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotARepository(root));
        }
        let lock = Lock::acquire(&root)?;
        if !root.join(config::FILE_NAME).is_file() {
            drop(lock);
            return Err(Error::NotARepository(root));
        }
        let config = Config::load(&root)?;
        let segments = Fs::new(root.clone(), config.segments_per_dir)?;
        debug!("opened repository {} ({})", root.display(), hex::encode(config.id));

        let mut repository = Self {
            root,
            config,
            segments,
            _lock: lock,
            loaded: None,
            delta: HashMap::new(),
            txn: None,
            check_needed: false,
            tainted: false,
        };
        repository.remove_crashed_tail()?;
        Ok(repository)
    }

    /// Create a fresh, empty repository at `root` and open it.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::create_with(root, Options::default())
    }

    /// Like [`Self::create`], with explicit [`Options`].
    pub fn create_with(root: impl Into<PathBuf>, opts: Options) -> Result<Self, Error> {
        let root = root.into();
        if root.exists() {
            if !root.is_dir() || root.read_dir()?.next().is_some() {
                return Err(Error::AlreadyExists(root));
            }
        } else {
            fs::create_dir(&root)?;
        }

        let config = Config::generate(&opts);
        config.write_atomic(&root)?;
        fs::create_dir_all(root.join(repo::fs::DATA_DIR))?;
        sync_dir(&root)?;
        info!("created repository {} ({})", root.display(), hex::encode(config.id));

        Self::open(root)
    }

    /// Store `data` under `key`.
    ///
    /// Any prior mapping for `key` is overwritten; the previous on-disk
    /// record becomes unreferenced garbage.
    pub fn put(&mut self, key: &Key, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("object of {} bytes exceeds maximum size", data.len()),
            )));
        }
        let slot = self.append(&Record::Put {
            key: *key,
            data: data.to_vec(),
        })?;
        self.delta.insert(*key, Some(slot));
        Ok(())
    }

    /// Retrieve the object stored under `key`.
    ///
    /// The record is re-read and re-validated from disk on every call.
    pub fn get(&mut self, key: &Key) -> Result<Vec<u8>, Error> {
        if self.check_needed {
            return Err(Error::CheckNeeded);
        }
        let slot = match self.delta.get(key).copied() {
            Some(Some(slot)) => slot,
            Some(None) => return Err(Error::DoesNotExist(*key)),
            None => self
                .snapshot()?
                .index
                .get(key)
                .copied()
                .ok_or(Error::DoesNotExist(*key))?,
        };
        self.read_object(key, slot)
    }

    /// Remove the object stored under `key`.
    pub fn delete(&mut self, key: &Key) -> Result<(), Error> {
        if self.check_needed {
            return Err(Error::CheckNeeded);
        }
        let exists = match self.delta.get(key) {
            Some(staged) => staged.is_some(),
            None => self.snapshot()?.index.get(key).is_some(),
        };
        if !exists {
            return Err(Error::DoesNotExist(*key));
        }
        self.append(&Record::Delete { key: *key })?;
        self.delta.insert(*key, None);
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// Appends a COMMIT record, flushes the transaction's segments and
    /// their directory entries, then atomically replaces the index
    /// snapshot with one named after the just-committed segment. With
    /// nothing staged this is a no-op.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.check_needed {
            return Err(Error::CheckNeeded);
        }
        let Some(txn) = self.txn.as_mut() else {
            debug!("commit: no open transaction");
            return Ok(());
        };
        txn.writer.append(&Record::Commit)?;
        txn.writer.fsync()?;
        let head = txn.segment;
        self.segments.sync_dirs(head)?;
        self.txn = None;

        let mut snapshot = match self.loaded.take() {
            Some(loaded) => loaded.index,
            // A transaction cannot be open without a loaded snapshot.
            None => return Err(Error::CheckNeeded),
        };
        for (key, staged) in mem::take(&mut self.delta) {
            match staged {
                Some(slot) => snapshot.set(key, slot),
                None => snapshot.remove(&key),
            }
        }
        snapshot.write_atomic(&self.root, head)?;
        index::remove_except(&self.root, head)?;
        sync_dir(&self.root)?;
        info!("committed segment {head}");

        // The snapshot stays dropped: the next access reloads it and
        // re-validates the index against the log.
        Ok(())
    }

    /// Discard the open transaction, if any.
    ///
    /// The transaction's segments are deleted, the staged overlay is
    /// cleared, and the committed snapshot is dropped so the next access
    /// revalidates it against the log.
    pub fn rollback(&mut self) -> Result<(), Error> {
        if let Some(txn) = self.txn.take() {
            let Txn {
                writer, created, ..
            } = txn;
            drop(writer);
            for id in created.iter().rev() {
                self.segments.remove_segment(*id)?;
                self.segments.sync_dirs(*id)?;
            }
            debug!("rolled back segments {created:?}");
        }
        self.delta.clear();
        self.loaded = None;
        if self.tainted {
            info!("integrity error observed, repository now requires a check");
            self.check_needed = true;
            self.tainted = false;
        }
        Ok(())
    }

    /// Roll back pending work and release the lock.
    pub fn close(mut self) -> Result<(), Error> {
        self.rollback()
    }

    /// Validate the repository against its log; with `repair`, restore
    /// consistency by rebuilding the index and discarding data that can
    /// no longer be reached from an intact COMMIT.
    ///
    /// Returns `true` iff the repository is (now) self-consistent. With
    /// `repair = false` the repository is never modified. An open
    /// transaction is rolled back first.
    pub fn check(&mut self, repair: bool) -> Result<bool, Error> {
        if self.txn.is_some() {
            warn!("check requested with an open transaction, rolling back");
        }
        self.rollback()?;
        let consistent = check::run(&self.root, &self.segments, repair)?;
        if consistent && repair {
            self.check_needed = false;
            self.tainted = false;
        }
        Ok(consistent)
    }

    /// The committed key set, in unspecified order.
    ///
    /// Staged, uncommitted operations are not reflected.
    pub fn keys(&mut self) -> Result<Vec<Key>, Error> {
        if self.check_needed {
            return Err(Error::CheckNeeded);
        }
        Ok(self.snapshot()?.index.keys().copied().collect())
    }

    /// Lazily load and validate the committed snapshot.
    fn snapshot(&mut self) -> Result<&Loaded, Error> {
        if self.check_needed {
            return Err(Error::CheckNeeded);
        }
        if self.loaded.is_none() {
            match self.load_from_disk()? {
                Some(loaded) => self.loaded = Some(loaded),
                None => {
                    warn!("index and log disagree, repository now requires a check");
                    self.check_needed = true;
                    return Err(Error::CheckNeeded);
                }
            }
        }
        self.loaded.as_ref().ok_or(Error::CheckNeeded)
    }

    /// Read the newest index from disk, if it agrees with the log.
    ///
    /// `None` means the repository is in a state only the checker can
    /// untangle: no or several index files, an index named after a
    /// segment that is not the newest committed one, or an unreadable
    /// index.
    fn load_from_disk(&self) -> Result<Option<Loaded>, Error> {
        let ids = self.segments.existing_segments()?;
        let committed = repo::last_committed(&self.segments, &ids)?;
        let index_ids = index::existing_ids(&self.root)?;
        debug!("index files {index_ids:?}, newest committed segment {committed:?}");

        match (index_ids.as_slice(), committed) {
            ([], None) => Ok(Some(Loaded {
                committed: None,
                index: Index::default(),
            })),
            ([id], Some(c)) if *id == c => {
                match Index::load(&self.root.join(index::file_name(c))) {
                    Ok(index) => Ok(Some(Loaded {
                        committed: Some(c),
                        index,
                    })),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::NotFound
                                | io::ErrorKind::InvalidData
                                | io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        warn!("index.{c} is unreadable: {e}");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(None),
        }
    }

    /// Ensure a transaction is open, creating its first segment on demand.
    fn begin(&mut self) -> Result<(), Error> {
        if self.txn.is_some() {
            return Ok(());
        }
        self.snapshot()?;
        let head = self
            .loaded
            .as_ref()
            .and_then(|loaded| loaded.committed)
            .map_or(0, |committed| committed + 1);
        debug!("starting transaction in segment {head}");
        let writer = repo::create_segment_writer(&self.segments, head)?;
        self.txn = Some(Txn {
            writer,
            segment: head,
            created: vec![head],
        });
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<Slot, Error> {
        self.begin()?;
        let Some(txn) = self.txn.as_mut() else {
            return Err(Error::CheckNeeded);
        };
        Ok(txn.append(&self.segments, self.config.max_segment_size, record)?)
    }

    /// Read and validate the PUT record for `key` at `slot`.
    fn read_object(&mut self, key: &Key, slot: Slot) -> Result<Vec<u8>, Error> {
        // The slot may point into a segment the open transaction is
        // still buffering.
        if let Some(txn) = self.txn.as_mut() {
            if txn.created.contains(&slot.segment) {
                txn.writer.flush()?;
            }
        }

        let mut segment = match self.segments.open_segment(slot.segment) {
            Ok(segment) => segment,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("segment {} has vanished, repository now requires a check", slot.segment);
                self.check_needed = true;
                return Err(Error::CheckNeeded);
            }
            Err(e) => return Err(e.into()),
        };
        segment.seek(SeekFrom::Start(u64::from(slot.offset)))?;

        let source = match Record::decode(&mut segment) {
            Ok(Some(Record::Put { key: stored, data })) if stored == *key => return Ok(data),
            Ok(Some(_)) => io::Error::new(
                io::ErrorKind::InvalidData,
                "record does not match the requested key",
            ),
            Ok(None) => io::Error::new(io::ErrorKind::UnexpectedEof, "record past end of segment"),
            Err(e) => e,
        };
        self.tainted = true;
        Err(Error::Integrity {
            segment: slot.segment,
            offset: slot.offset,
            source,
        })
    }

    /// Remove trailing uncommitted segments left behind by a crashed
    /// writer, the crashed process's rollback in effect.
    ///
    /// Disk is only touched when the newest index agrees with the log;
    /// anything else is left in place for [`Self::check`] to examine.
    fn remove_crashed_tail(&mut self) -> Result<(), Error> {
        let ids = self.segments.existing_segments()?;
        let committed = repo::last_committed(&self.segments, &ids)?;
        let index_ids = index::existing_ids(&self.root)?;
        let agrees = match (index_ids.as_slice(), committed) {
            ([], None) => true,
            ([id], Some(c)) => *id == c,
            _ => false,
        };
        if !agrees {
            return Ok(());
        }

        for id in ids.into_iter().rev() {
            if Some(id) <= committed {
                break;
            }
            warn!("removing uncommitted segment {id} left by a crashed transaction");
            self.segments.remove_segment(id)?;
            self.segments.sync_dirs(id)?;
        }
        Ok(())
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if self.txn.is_some() {
            warn!("repository dropped with an open transaction, rolling back");
            if let Err(e) = self.rollback() {
                warn!("rollback on drop failed: {e}");
            }
        }
    }
}

impl Store for Repository {
    fn put(&mut self, key: &Key, data: &[u8]) -> Result<(), Error> {
        Repository::put(self, key, data)
    }

    fn get(&mut self, key: &Key) -> Result<Vec<u8>, Error> {
        Repository::get(self, key)
    }

    fn delete(&mut self, key: &Key) -> Result<(), Error> {
        Repository::delete(self, key)
    }

    fn commit(&mut self) -> Result<(), Error> {
        Repository::commit(self)
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Repository::rollback(self)
    }

    fn check(&mut self, repair: bool) -> Result<bool, Error> {
        Repository::check(self, repair)
    }

    fn keys(&mut self) -> Result<Vec<Key>, Error> {
        Repository::keys(self)
    }
}
