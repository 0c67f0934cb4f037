use std::{
    fmt,
    fs::{self, File},
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use itertools::Itertools as _;
use log::debug;
use tempfile::NamedTempFile;

use super::Repo;
use crate::SegmentId;

pub const DATA_DIR: &str = "data";

/// Segment storage in ordinary files on disk.
///
/// Segment `id` lives at `data/<id / segments_per_dir>/<id>` below the
/// repository root, both components in plain decimal.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
    segments_per_dir: u32,
}

impl Fs {
    /// Segment storage below the repository at `root`.
    ///
    /// Creates the `data` directory if it is missing.
    pub fn new(root: PathBuf, segments_per_dir: u32) -> io::Result<Self> {
        fs::create_dir_all(root.join(DATA_DIR))?;
        Ok(Self {
            root,
            segments_per_dir,
        })
    }

    fn bucket(&self, id: SegmentId) -> PathBuf {
        self.root
            .join(DATA_DIR)
            .join((id / self.segments_per_dir).to_string())
    }

    /// Path of the segment file for `id` within this repository.
    pub fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.bucket(id).join(id.to_string())
    }

    /// Flush the directory entries covering segment `id`: its bucket and
    /// the `data` directory itself.
    pub fn sync_dirs(&self, id: SegmentId) -> io::Result<()> {
        sync_dir(&self.bucket(id))?;
        sync_dir(&self.root.join(DATA_DIR))
    }

    /// Atomically replace the contents of segment `id`.
    ///
    /// Used by repair when rewriting a partially damaged segment; the new
    /// contents go to a temporary file in the same bucket which is then
    /// renamed over the original.
    pub fn replace_segment(&self, id: SegmentId, data: &[u8]) -> io::Result<()> {
        let bucket = self.bucket(id);
        let mut tmp = NamedTempFile::new_in(&bucket)?;
        tmp.as_file_mut().write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.segment_path(id)).map_err(|e| e.error)?;
        sync_dir(&bucket)
    }
}

impl fmt::Display for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

impl Repo for Fs {
    type Segment = File;

    fn create_segment(&self, id: SegmentId) -> io::Result<File> {
        fs::create_dir_all(self.bucket(id))?;
        File::options()
            .read(true)
            .append(true)
            .create_new(true)
            .open(self.segment_path(id))
            .or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    debug!("segment {id} already exists");
                    // If the segment is completely empty, a previous
                    // create was interrupted before the first write and
                    // the file can be adopted.
                    let file = File::options()
                        .read(true)
                        .append(true)
                        .open(self.segment_path(id))?;
                    if file.metadata()?.len() == 0 {
                        debug!("segment {id} is empty");
                        return Ok(file);
                    }

                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("repo {self}: segment {id} already exists and is non-empty"),
                    ));
                }

                Err(e)
            })
    }

    fn open_segment(&self, id: SegmentId) -> io::Result<File> {
        File::open(self.segment_path(id))
    }

    fn remove_segment(&self, id: SegmentId) -> io::Result<()> {
        debug!("removing segment {id}");
        fs::remove_file(self.segment_path(id))
    }

    fn existing_segments(&self) -> io::Result<Vec<SegmentId>> {
        let mut ids = Vec::new();

        for bucket in fs::read_dir(self.root.join(DATA_DIR))? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            if bucket.file_name().to_string_lossy().parse::<u32>().is_err() {
                continue;
            }
            for entry in fs::read_dir(bucket.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Ok(id) = entry.file_name().to_string_lossy().parse::<SegmentId>() else {
                    continue;
                };
                ids.push(id);
            }
        }

        Ok(ids.into_iter().sorted_unstable().collect())
    }
}

/// Flush a directory entry to stable storage.
///
/// Needed after creating, renaming or removing files for the change
/// itself to be durable.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(path)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
