//! Record framing.
//!
//! A segment file is a plain concatenation of records:
//!
//! ```text
//! crc32c : u32 le   checksum over everything that follows
//! size   : u32 le   total record length, including crc and size
//! tag    : u8       PUT | DELETE | COMMIT
//! key    : [u8; 32] PUT and DELETE only
//! data   : [u8]     PUT only
//! ```
//!
//! The checksum leads so that a record whose body was damaged on disk but
//! whose `size` field is intact can be stepped over when scanning for
//! salvageable data.

use std::io::{self, Read, Write};

use crc32c::Crc32cReader;

use crate::{error::ChecksumMismatch, Key};

pub const TAG_PUT: u8 = 0;
pub const TAG_DELETE: u8 = 1;
pub const TAG_COMMIT: u8 = 2;

/// Framing shared by all records: crc + size + tag.
pub const FRAMING_LEN: usize = 4 + 4 + 1;
/// A COMMIT record is framing only.
pub const COMMIT_LEN: usize = FRAMING_LEN;
/// Length of a DELETE record; also the minimum length of a PUT.
pub const KEYED_LEN: usize = FRAMING_LEN + 32;

/// Hard cap on payload length, enforced on both write and read.
pub const MAX_OBJECT_SIZE: usize = 20 * 1024 * 1024;
/// Largest well-formed record: a PUT of a maximum-size payload.
pub const MAX_RECORD_LEN: usize = KEYED_LEN + MAX_OBJECT_SIZE;

/// One entry in a segment file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    /// Installs or overwrites the object stored under `key`.
    Put { key: Key, data: Vec<u8> },
    /// Tombstone for `key`.
    Delete { key: Key },
    /// Promotes all records preceding it, in this and any earlier
    /// uncommitted segment, to durable visibility.
    Commit,
}

impl Record {
    /// Length in bytes of this record when written via [`Self::write`].
    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Put { data, .. } => KEYED_LEN + data.len(),
            Record::Delete { .. } => KEYED_LEN,
            Record::Commit => COMMIT_LEN,
        }
    }

    /// Serialize and write `self` to `out`.
    ///
    /// Returns the crc32 checksum of the record on success.
    pub fn write<W: Write>(&self, mut out: W) -> io::Result<u32> {
        let size = (self.encoded_len() as u32).to_le_bytes();
        let (tag, key, data): (u8, Option<&Key>, &[u8]) = match self {
            Record::Put { key, data } => (TAG_PUT, Some(key), data),
            Record::Delete { key } => (TAG_DELETE, Some(key), &[]),
            Record::Commit => (TAG_COMMIT, None, &[]),
        };

        let mut crc = crc32c::crc32c(&size);
        crc = crc32c::crc32c_append(crc, &[tag]);
        if let Some(key) = key {
            crc = crc32c::crc32c_append(crc, key);
        }
        crc = crc32c::crc32c_append(crc, data);

        out.write_all(&crc.to_le_bytes())?;
        out.write_all(&size)?;
        out.write_all(&[tag])?;
        if let Some(key) = key {
            out.write_all(key)?;
        }
        out.write_all(data)?;

        Ok(crc)
    }

    /// Attempt to read one [`Record`] from the given [`Read`]er.
    ///
    /// Returns `None` if the reader is already at EOF.
    ///
    /// Verifies the checksum of the record. If it doesn't match, an error
    /// of kind [`io::ErrorKind::InvalidData`] with an inner error
    /// downcastable to [`ChecksumMismatch`] is returned.
    pub fn decode<R: Read>(mut reader: R) -> io::Result<Option<Self>> {
        let mut crc = [0; 4];
        if let Err(e) = reader.read_exact(&mut crc) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
        let crc = u32::from_le_bytes(crc);

        let mut reader = Crc32cReader::new(reader);
        let size = decode_u32(&mut reader)? as usize;
        if !(FRAMING_LEN..=MAX_RECORD_LEN).contains(&size) {
            return Err(invalid_data(format!("record size {size} out of bounds")));
        }
        let mut tag = [0; 1];
        reader.read_exact(&mut tag)?;
        let record = match tag[0] {
            TAG_COMMIT if size == COMMIT_LEN => Record::Commit,
            TAG_DELETE if size == KEYED_LEN => Record::Delete {
                key: decode_key(&mut reader)?,
            },
            TAG_PUT if size >= KEYED_LEN => {
                let key = decode_key(&mut reader)?;
                let mut data = vec![0; size - KEYED_LEN];
                reader.read_exact(&mut data)?;
                Record::Put { key, data }
            }
            tag => {
                return Err(invalid_data(format!(
                    "invalid record tag {tag} for size {size}"
                )))
            }
        };

        if reader.crc32c() != crc {
            return Err(invalid_data(ChecksumMismatch));
        }

        Ok(Some(record))
    }
}

fn decode_u32<R: Read>(mut read: R) -> io::Result<u32> {
    let mut buf = [0; 4];
    read.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn decode_key<R: Read>(mut read: R) -> io::Result<Key> {
    let mut key = [0; 32];
    read.read_exact(&mut key)?;
    Ok(key)
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}
