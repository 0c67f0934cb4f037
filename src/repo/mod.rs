use std::io::{self, Read};

use crate::{segment, SegmentId};

pub(crate) mod fs;
#[cfg(test)]
pub(crate) mod mem;

pub use fs::Fs;
#[cfg(test)]
pub use mem::Memory;

/// A store of numbered segment files.
///
/// This is mainly an internal trait to allow testing the segment layer
/// against an in-memory representation.
pub trait Repo {
    /// The type of segments managed by this repo, which must behave like
    /// a file. Segments returned by [`Self::open_segment`] are only ever
    /// read from.
    type Segment: io::Read + io::Write + io::Seek + segment::FileLike;

    /// Create a new segment numbered `id`.
    ///
    /// This **must** create the segment atomically, and return
    /// [`io::ErrorKind::AlreadyExists`] if a non-empty segment with that
    /// id already exists.
    fn create_segment(&self, id: SegmentId) -> io::Result<Self::Segment>;

    /// Open the existing segment `id` for reading.
    ///
    /// Must return [`io::ErrorKind::NotFound`] if it does not exist.
    fn open_segment(&self, id: SegmentId) -> io::Result<Self::Segment>;

    /// Remove the segment `id`.
    ///
    /// Must return [`io::ErrorKind::NotFound`] if it does not exist.
    fn remove_segment(&self, id: SegmentId) -> io::Result<()>;

    /// All existing segment ids, sorted in ascending order.
    fn existing_segments(&self) -> io::Result<Vec<SegmentId>>;
}

/// Create a fresh [`segment::Writer`] for segment `id`.
pub fn create_segment_writer<R: Repo>(
    repo: &R,
    id: SegmentId,
) -> io::Result<segment::Writer<R::Segment>> {
    repo.create_segment(id).map(segment::Writer::new)
}

/// Read the entire contents of segment `id`.
pub fn read_segment<R: Repo>(repo: &R, id: SegmentId) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    repo.open_segment(id)?.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Id of the newest segment that ends with a COMMIT record, if any.
///
/// `ids` must be sorted in ascending order, as returned by
/// [`Repo::existing_segments`].
pub fn last_committed<R: Repo>(repo: &R, ids: &[SegmentId]) -> io::Result<Option<SegmentId>> {
    for &id in ids.iter().rev() {
        let mut segment = repo.open_segment(id)?;
        if segment::ends_with_commit(&mut segment)? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}
