//! The persistent key → [`Slot`] map.
//!
//! An index file is a wholesale snapshot of the committed mapping, named
//! `index.<N>` where `N` is the id of the newest committed segment at the
//! time it was written. It is derived state: opening a repository only
//! trusts it when its name agrees with the log, and repair rebuilds it
//! from the segments alone.
//!
//! ```text
//! magic   : 8 bytes   b"OBJSIDX\x01"
//! count   : u32 le
//! entries : count * (key[32] | segment u32 le | offset u32 le)
//! crc32c  : u32 le    over count and entries
//! ```

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use crc32c::{Crc32cReader, Crc32cWriter};
use itertools::Itertools as _;
use log::debug;
use tempfile::NamedTempFile;

use crate::{error::ChecksumMismatch, repo::fs::sync_dir, Key, SegmentId, Slot};

pub const MAGIC: [u8; 8] = *b"OBJSIDX\x01";

const FILE_PREFIX: &str = "index.";

/// In-memory snapshot of the committed key → [`Slot`] mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Index {
    entries: HashMap<Key, Slot>,
}

impl Index {
    pub fn get(&self, key: &Key) -> Option<&Slot> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: Key, slot: Slot) {
        self.entries.insert(key, slot);
    }

    pub fn remove(&mut self, key: &Key) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    /// Load an index file, verifying magic and checksum.
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0; MAGIC.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "index file does not start with magic",
            ));
        }

        let mut reader = Crc32cReader::new(reader);
        let count = decode_u32(&mut reader)?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let mut key = [0; 32];
            reader.read_exact(&mut key)?;
            let segment = decode_u32(&mut reader)?;
            let offset = decode_u32(&mut reader)?;
            entries.insert(key, Slot { segment, offset });
        }

        let crc = reader.crc32c();
        if decode_u32(reader.into_inner())? != crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, ChecksumMismatch));
        }

        Ok(Self { entries })
    }

    /// Write `self` as `index.<id>` under `dir`, atomically.
    ///
    /// The snapshot goes to a temporary file in `dir` which is renamed
    /// over the target; the directory entry is flushed afterwards.
    pub fn write_atomic(&self, dir: &Path, id: SegmentId) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            out.write_all(&MAGIC)?;
            let mut out = Crc32cWriter::new(out);
            out.write_all(&(self.entries.len() as u32).to_le_bytes())?;
            for (key, slot) in &self.entries {
                out.write_all(key)?;
                out.write_all(&slot.segment.to_le_bytes())?;
                out.write_all(&slot.offset.to_le_bytes())?;
            }
            let crc = out.crc32c();
            let mut out = out.into_inner();
            out.write_all(&crc.to_le_bytes())?;
            out.flush()?;
        }
        tmp.as_file().sync_all()?;

        let path = dir.join(file_name(id));
        debug!("writing index {}", path.display());
        tmp.persist(path).map_err(|e| e.error)?;
        sync_dir(dir)
    }
}

impl FromIterator<(Key, Slot)> for Index {
    fn from_iter<I: IntoIterator<Item = (Key, Slot)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// File name of the index snapshot taken at committed segment `id`.
pub fn file_name(id: SegmentId) -> String {
    format!("{FILE_PREFIX}{id}")
}

/// All `index.<N>` files under `dir`, ascending by `N`.
pub fn existing_ids(dir: &Path) -> io::Result<Vec<SegmentId>> {
    let ids = fs::read_dir(dir)?
        .filter_map_ok(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix(FILE_PREFIX)
                .and_then(|n| n.parse::<SegmentId>().ok())
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().sorted_unstable().collect())
}

/// Remove every `index.<N>` under `dir` except `index.<keep>`.
pub fn remove_except(dir: &Path, keep: SegmentId) -> io::Result<()> {
    for id in existing_ids(dir)? {
        if id != keep {
            let path = dir.join(file_name(id));
            debug!("removing superseded index {}", path.display());
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn decode_u32<R: Read>(mut read: R) -> io::Result<u32> {
    let mut buf = [0; 4];
    read.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample() -> Index {
        (0..64u8)
            .map(|n| {
                (
                    [n; 32],
                    Slot {
                        segment: u32::from(n) / 10,
                        offset: u32::from(n) * 45,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn write_load_roundtrip() {
        let tmp = tempdir().unwrap();
        let index = sample();

        index.write_atomic(tmp.path(), 6).unwrap();
        let loaded = Index::load(&tmp.path().join("index.6")).unwrap();

        assert_eq!(index, loaded);
        assert_eq!(existing_ids(tmp.path()).unwrap(), vec![6]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = tempdir().unwrap();
        sample().write_atomic(tmp.path(), 0).unwrap();

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["index.0"]);
    }

    #[test]
    fn load_rejects_corruption() {
        let tmp = tempdir().unwrap();
        sample().write_atomic(tmp.path(), 0).unwrap();
        let path = tmp.path().join("index.0");

        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = Index::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn discovery_and_removal() {
        let tmp = tempdir().unwrap();
        let index = Index::default();
        for id in [3, 0, 17] {
            index.write_atomic(tmp.path(), id).unwrap();
        }
        fs::write(tmp.path().join("index.bogus"), b"").unwrap();

        assert_eq!(existing_ids(tmp.path()).unwrap(), vec![0, 3, 17]);

        remove_except(tmp.path(), 17).unwrap();
        assert_eq!(existing_ids(tmp.path()).unwrap(), vec![17]);
    }
}
