//! Consistency checking and repair.
//!
//! The checker ignores the index and derives truth from the segment log
//! alone: the newest segment whose scan ends in a well-formed COMMIT
//! record defines the committed state, everything above it is an
//! abandoned transaction, and the index must be the single snapshot named
//! after that segment. Repair reconciles disk with that truth by
//! rewriting damaged segments around their salvageable records, dropping
//! the abandoned tail, and rotating forward: a fresh segment holding a
//! single COMMIT becomes the new head, and the rebuilt index is named
//! after it.

use std::{fmt::Display, path::Path};

use log::{debug, info, warn};

use crate::{
    error::Error,
    index::{self, Index},
    record::Record,
    repo::{self, fs::sync_dir, Fs, Repo as _},
    segment::{self, FileLike as _, Scan},
    SegmentId, Slot,
};

/// Tally of inconsistencies found during a check run.
#[derive(Debug, Default)]
struct Report {
    errors: usize,
}

impl Report {
    fn error(&mut self, msg: impl Display) {
        warn!("check: {msg}");
        self.errors += 1;
    }

    fn clean(&self) -> bool {
        self.errors == 0
    }
}

/// Check the repository at `root`; with `repair`, restore consistency.
///
/// Returns `true` iff the repository is consistent when the function
/// returns. Never touches disk unless `repair` is set, and even then only
/// when an inconsistency was found, so a repair run on a clean repository
/// is a no-op.
pub(crate) fn run(root: &Path, segments: &Fs, repair: bool) -> Result<bool, Error> {
    let mut report = Report::default();

    let ids = segments.existing_segments()?;
    let index_ids = index::existing_ids(root)?;

    // Find the newest committed segment, scanning backwards.
    let mut committed = None;
    for &id in ids.iter().rev() {
        let data = repo::read_segment(segments, id)?;
        if segment::scan(&data).committed_up_to.is_some() {
            committed = Some(id);
            break;
        }
    }

    // The range of segments contributing to the committed state. When
    // nothing is committed but an index exists, a COMMIT record was
    // destroyed rather than never written, and the segments still hold
    // salvageable data. Without an index they are an abandoned first
    // transaction and get discarded wholesale.
    let bound = match committed {
        Some(id) => Some(id),
        None if !index_ids.is_empty() => ids.last().copied(),
        None => None,
    };
    debug!("segments {ids:?}, committed {committed:?}, scan bound {bound:?}");

    let index_id_matches = match (index_ids.as_slice(), committed) {
        ([], None) => true,
        ([id], Some(c)) if *id == c => true,
        _ => {
            report.error(format!(
                "index files {index_ids:?} do not match newest committed segment {committed:?}"
            ));
            false
        }
    };

    // Replay every segment within the bound, salvaging what a damaged
    // one still holds.
    let mut rebuilt = Index::default();
    let mut prev: Option<SegmentId> = None;
    for &id in ids.iter().filter(|&&id| Some(id) <= bound) {
        if let Some(prev) = prev {
            if id != prev + 1 {
                report.error(format!(
                    "segments {}..{} are missing, committed objects may be lost",
                    prev + 1,
                    id
                ));
            }
        }
        prev = Some(id);

        let data = repo::read_segment(segments, id)?;
        let scan = segment::scan(&data);
        if scan.corrupt {
            report.error(format!("segment {id} contains corrupt records"));
        }
        if scan.trailing_data() {
            report.error(format!("segment {id} has data after its last COMMIT"));
        }

        let records = if repair && (scan.corrupt || scan.trailing_data()) {
            rewrite(segments, id, &scan)?
        } else {
            effective(&scan)
        };
        for (offset, record) in records {
            match record {
                Record::Put { key, .. } => rebuilt.set(key, Slot { segment: id, offset }),
                Record::Delete { key } => rebuilt.remove(&key),
                Record::Commit => {}
            }
        }
    }

    // Anything above the bound is an abandoned transaction.
    for &id in ids.iter().filter(|&&id| Some(id) > bound) {
        report.error(format!("segment {id} contains uncommitted data"));
        if repair {
            segments.remove_segment(id)?;
            segments.sync_dirs(id)?;
        }
    }

    // The index snapshot must equal the replayed state.
    if let (true, Some(c)) = (index_id_matches, committed) {
        match Index::load(&root.join(index::file_name(c))) {
            Ok(on_disk) if on_disk == rebuilt => {}
            Ok(_) => report.error(format!("index.{c} does not match the segment data")),
            Err(e) => report.error(format!("index.{c} is unreadable: {e}")),
        }
    }

    if repair && !report.clean() {
        // Rotate forward: the rebuilt index is named after a fresh,
        // trivially committed segment, so its name agrees with the log
        // head no matter what state the old segments were in.
        let head = match bound {
            Some(bound) => bound + 1,
            None => ids.last().map_or(0, |last| last + 1),
        };
        info!(
            "repair: recovered {} objects, rotating to new head segment {head}",
            rebuilt.len()
        );
        let mut writer = repo::create_segment_writer(segments, head)?;
        writer.append(&Record::Commit)?;
        writer.fsync()?;
        segments.sync_dirs(head)?;

        rebuilt.write_atomic(root, head)?;
        index::remove_except(root, head)?;
        sync_dir(root)?;
    }

    Ok(report.clean() || repair)
}

/// The records of `scan` that contribute to the committed state: all of
/// them in a segment without a COMMIT (its records are covered by a later
/// segment's COMMIT), otherwise only those before the last COMMIT.
fn effective(scan: &Scan) -> Vec<(u32, Record)> {
    scan.records
        .iter()
        .filter(|(offset, _)| scan.committed_up_to.map_or(true, |end| *offset < end))
        .cloned()
        .collect()
}

/// Rewrite segment `id` keeping only the effective records of `scan`,
/// and return them together with their offsets in the rewritten file.
fn rewrite(segments: &Fs, id: SegmentId, scan: &Scan) -> Result<Vec<(u32, Record)>, Error> {
    info!(
        "repair: rewriting segment {id} around {} salvaged records",
        scan.records.len()
    );
    let mut data = Vec::new();
    let mut records = Vec::new();
    for (_, record) in effective(scan) {
        let offset = data.len() as u32;
        record.write(&mut data)?;
        records.push((offset, record));
    }
    segments.replace_segment(id, &data)?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

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
    fn effective_stops_at_the_last_commit() {
        let mut data = segment_bytes(&[put(1), Record::Commit]);
        // A complete record after the COMMIT is still garbage.
        data.extend_from_slice(&segment_bytes(&[put(2)]));
        let scan = segment::scan(&data);
        assert_eq!(scan.records.len(), 3);

        let records = effective(&scan);
        assert_eq!(records.len(), 2);
        assert!(matches!(records.last(), Some((_, Record::Commit))));
    }

    #[test]
    fn effective_keeps_everything_without_a_commit() {
        let data = segment_bytes(&[put(1), put(2)]);
        assert_eq!(effective(&segment::scan(&data)).len(), 2);
    }

    #[test]
    fn rewrite_compacts_offsets_around_damage() {
        let tmp = tempdir().unwrap();
        let segments = Fs::new(tmp.path().to_path_buf(), 10).unwrap();
        drop(repo::create_segment_writer(&segments, 0).unwrap());

        let mut data = segment_bytes(&[put(4), put(5), put(6), Record::Commit]);
        // Damage the checksum of the middle record.
        data[45..49].copy_from_slice(b"BOOM");
        segments.replace_segment(0, &data).unwrap();

        let scan = segment::scan(&data);
        let records = rewrite(&segments, 0, &scan).unwrap();
        assert_eq!(
            records.iter().map(|(offset, _)| *offset).collect::<Vec<_>>(),
            vec![0, 45, 90]
        );

        let rescan = segment::scan(&repo::read_segment(&segments, 0).unwrap());
        assert!(!rescan.corrupt);
        assert_eq!(rescan.records.len(), 3);
        assert_eq!(rescan.committed_up_to, Some(99));
    }

    #[test]
    fn run_flags_and_replaces_a_pending_tail() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let segments = Fs::new(root.clone(), 10).unwrap();

        let mut writer = repo::create_segment_writer(&segments, 0).unwrap();
        writer.append(&put(1)).unwrap();
        writer.append(&Record::Commit).unwrap();
        writer.fsync().unwrap();
        let mut committed = Index::default();
        committed.set([1; 32], Slot { segment: 0, offset: 0 });
        committed.write_atomic(&root, 0).unwrap();

        // An abandoned transaction above the committed head.
        let mut writer = repo::create_segment_writer(&segments, 1).unwrap();
        writer.append(&put(2)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert!(!run(&root, &segments, false).unwrap());
        // A non-repair run never touches disk.
        assert!(!run(&root, &segments, false).unwrap());
        assert!(segment::scan(&repo::read_segment(&segments, 1).unwrap()).committed_up_to.is_none());

        assert!(run(&root, &segments, true).unwrap());
        // The tail is gone; a fresh committed head took its id.
        let head = segment::scan(&repo::read_segment(&segments, 1).unwrap());
        assert_eq!(head.records, vec![(0, Record::Commit)]);
        assert_eq!(index::existing_ids(&root).unwrap(), vec![1]);
        assert!(run(&root, &segments, false).unwrap());
    }

    #[test]
    fn run_discards_never_committed_segments() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let segments = Fs::new(root.clone(), 10).unwrap();

        let mut writer = repo::create_segment_writer(&segments, 0).unwrap();
        writer.append(&put(1)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert!(!run(&root, &segments, false).unwrap());
        assert!(run(&root, &segments, true).unwrap());
        // Nothing was ever committed, so the data is not salvaged.
        assert!(!segments.segment_path(0).exists());
        assert_eq!(index::existing_ids(&root).unwrap(), vec![1]);
        let head = segment::scan(&repo::read_segment(&segments, 1).unwrap());
        assert_eq!(head.records, vec![(0, Record::Commit)]);
    }
}
