//! Writing and scanning of individual segment files.
//!
//! A segment is an append-only sequence of [`Record`]s, named by its
//! [`crate::SegmentId`]. Segments carry no file header; their identity is
//! their name, and their contents are self-validating through per-record
//! checksums.

use std::{
    fs::File,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write as _},
};

use crate::record::{Record, COMMIT_LEN};

/// File-like operations beyond the std I/O traits.
pub trait FileLike {
    fn fsync(&mut self) -> io::Result<()>;
}

impl FileLike for File {
    fn fsync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Appends records to a segment.
#[derive(Debug)]
pub struct Writer<W: io::Write> {
    inner: BufWriter<W>,
    bytes_written: u64,
}

impl<W: io::Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            bytes_written: 0,
        }
    }

    /// Append `record`, returning the offset of its first byte.
    pub fn append(&mut self, record: &Record) -> io::Result<u64> {
        let offset = self.bytes_written;
        record.write(&mut self.inner)?;
        self.bytes_written += record.encoded_len() as u64;
        Ok(offset)
    }

    /// Flush buffered records to the underlying segment.
    ///
    /// This makes them visible to readers of the file, but does not imply
    /// durability; call [`Self::fsync`] for that.
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Number of bytes written to this segment.
    pub fn len(&self) -> u64 {
        self.bytes_written
    }

    /// `true` if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }
}

impl<W: io::Write + FileLike> FileLike for Writer<W> {
    fn fsync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().fsync()
    }
}

/// `true` if the segment ends with a well-formed COMMIT record.
///
/// This is the cheap probe used when opening a repository and loading its
/// index; [`scan`] is the authoritative version used by the checker.
pub fn ends_with_commit<S: Read + Seek>(segment: &mut S) -> io::Result<bool> {
    let len = segment.seek(SeekFrom::End(0))?;
    if len < COMMIT_LEN as u64 {
        return Ok(false);
    }
    segment.seek(SeekFrom::Start(len - COMMIT_LEN as u64))?;
    let mut buf = [0; COMMIT_LEN];
    segment.read_exact(&mut buf)?;
    Ok(matches!(
        Record::decode(&mut &buf[..]),
        Ok(Some(Record::Commit))
    ))
}

/// Outcome of scanning one segment.
#[derive(Debug, Default)]
pub struct Scan {
    /// Cleanly parsed records and the offsets they start at, in file order.
    pub records: Vec<(u32, Record)>,
    /// End offset of the last COMMIT record, if any.
    pub committed_up_to: Option<u32>,
    /// Some byte ranges did not parse as records.
    pub corrupt: bool,
    /// Length of the scanned data.
    pub len: u64,
}

impl Scan {
    /// `true` if there are bytes past the end of the last COMMIT record.
    pub fn trailing_data(&self) -> bool {
        self.committed_up_to
            .is_some_and(|end| u64::from(end) < self.len)
    }
}

/// Scan `data` for records, re-synchronizing after corruption.
///
/// Parsing starts at offset 0 and continues at the offset each cleanly
/// parsed record ends at. When parsing fails the scanner advances a
/// single byte and tries again, so a damaged record does not hide
/// everything behind it. Byte ranges that never parse, including a
/// record torn by an interrupted append, are reported via
/// [`Scan::corrupt`].
pub fn scan(data: &[u8]) -> Scan {
    let mut scan = Scan {
        len: data.len() as u64,
        ..Scan::default()
    };
    let mut pos = 0;
    while pos < data.len() {
        match Record::decode(&mut &data[pos..]) {
            Ok(Some(record)) => {
                let len = record.encoded_len();
                if let Record::Commit = record {
                    scan.committed_up_to = Some((pos + len) as u32);
                }
                scan.records.push((pos as u32, record));
                pos += len;
            }
            Ok(None) => break,
            Err(_) => {
                scan.corrupt = true;
                pos += 1;
            }
        }
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::FRAMING_LEN,
        repo::{self, Repo as _},
    };

    fn put(n: u8) -> Record {
        Record::Put {
            key: [n; 32],
            data: b"data".to_vec(),
        }
    }

    fn segment_bytes(records: &[Record]) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            record.write(&mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn write_read_roundtrip() {
        let repo = repo::Memory::default();

        let mut writer = repo::create_segment_writer(&repo, 0).unwrap();
        let offsets = [
            writer.append(&put(0)).unwrap(),
            writer.append(&put(1)).unwrap(),
            writer.append(&Record::Commit).unwrap(),
        ];
        writer.flush().unwrap();
        assert_eq!(offsets, [0, 45, 90]);

        let data = repo::read_segment(&repo, 0).unwrap();
        let scan = scan(&data);
        assert!(!scan.corrupt);
        assert_eq!(scan.committed_up_to, Some(data.len() as u32));
        assert_eq!(
            scan.records,
            vec![(0, put(0)), (45, put(1)), (90, Record::Commit)]
        );
    }

    #[test]
    fn ends_with_commit_probe() {
        let repo = repo::Memory::default();

        let mut writer = repo::create_segment_writer(&repo, 0).unwrap();
        writer.append(&put(0)).unwrap();
        writer.flush().unwrap();
        let mut segment = repo.open_segment(0).unwrap();
        assert!(!ends_with_commit(&mut segment).unwrap());

        let mut writer = repo::create_segment_writer(&repo, 1).unwrap();
        writer.append(&put(0)).unwrap();
        writer.append(&Record::Commit).unwrap();
        writer.flush().unwrap();
        let mut segment = repo.open_segment(1).unwrap();
        assert!(ends_with_commit(&mut segment).unwrap());
    }

    #[test]
    fn scan_skips_damaged_record() {
        let mut data = segment_bytes(&[put(4), put(5), put(6), Record::Commit]);
        // Overwrite the checksum of the middle record; its size field
        // stays intact, so the scanner can step over it.
        let offset = put(4).encoded_len();
        data[offset..offset + 4].copy_from_slice(b"BOOM");

        let scan = scan(&data);
        assert!(scan.corrupt);
        assert_eq!(scan.committed_up_to, Some(data.len() as u32));
        let keys: Vec<_> = scan
            .records
            .iter()
            .filter_map(|(_, r)| match r {
                Record::Put { key, .. } => Some(key[0]),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![4, 6]);
    }

    #[test]
    fn scan_detects_torn_commit() {
        let mut data = segment_bytes(&[put(1), put(2), Record::Commit]);
        *data.last_mut().unwrap() ^= 0xff;

        let scan = scan(&data);
        assert!(scan.corrupt);
        assert_eq!(scan.committed_up_to, None);
        assert_eq!(scan.records.len(), 2);
    }

    #[test]
    fn scan_reports_data_after_commit() {
        let mut data = segment_bytes(&[put(1), Record::Commit]);
        let committed = data.len() as u32;
        // An interrupted append leaves a record prefix behind.
        data.extend_from_slice(&segment_bytes(&[put(2)])[..FRAMING_LEN + 7]);

        let scan = scan(&data);
        assert_eq!(scan.committed_up_to, Some(committed));
        assert!(scan.trailing_data());
    }

    #[test]
    fn scan_empty() {
        let scan = scan(&[]);
        assert!(!scan.corrupt);
        assert!(scan.records.is_empty());
        assert_eq!(scan.committed_up_to, None);
    }
}
