//! Stream iterator — component D.
//!
//! Scans a byte range (an in-memory buffer, or a memory-mapped file) for
//! markers, validates each candidate record, and yields decoded
//! `(generation, payload)` pairs. Invalid candidates — malformed runs,
//! CRC mismatches, truncated records — are silently skipped: per
//! `spec.md` §7, corruption never surfaces as an error on the read path.

use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;

use tracing::trace;

use crate::codec::decode;
use crate::error::{CandidateError, StreamError};
use crate::marker::marker_find;
use crate::{CRC_SENTINEL, MAX_READ, RECORD_HEADER_LEN};

/// Backing storage for a [`StreamIter`]: either a caller-owned slice, or
/// a shared read-only memory mapping of a file. `Arc` lets
/// [`replay_partitioned`] hand out many independent iterators over one
/// mapping without re-mapping the file per partition.
#[derive(Clone)]
enum Backing<'a> {
    Borrowed(&'a [u8]),
    Mapped(Arc<memmap2::Mmap>),
}

impl Backing<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Borrowed(b) => b,
            Backing::Mapped(m) => m,
        }
    }
}

/// A restartable cursor over a stuffed record stream.
///
/// Values are independent: cloning or partitioning one does not affect
/// any other, and nothing here is shared across threads implicitly
/// (`spec.md` §5: "Iterators are independent values and not shared").
#[derive(Clone)]
pub struct StreamIter<'a> {
    data: Backing<'a>,
    cursor: usize,
    end: usize,
    stop_offset: usize,
    first_nonzero: usize,
    first_record: bool,
}

impl<'a> StreamIter<'a> {
    /// Initialises an iterator directly over an in-memory buffer.
    pub fn init_buf(buf: &'a [u8]) -> Self {
        StreamIter {
            data: Backing::Borrowed(buf),
            cursor: 0,
            end: buf.len(),
            stop_offset: buf.len(),
            first_nonzero: 0,
            first_record: true,
        }
    }

    /// Initialises an iterator over a file descriptor by memory-mapping
    /// it read-only.
    ///
    /// If the file is empty, behaves as an empty buffer. Otherwise skips
    /// any leading sparse hole (`lseek(fd, 0, SEEK_DATA)`) and any
    /// further contiguous run of zero bytes — no valid marker contains
    /// zeroes, and filesystems may zero-fill holes on read.
    pub fn init_fd(fd: RawFd) -> Result<StreamIter<'static>, StreamError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc != 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        let len = stat.st_size.max(0) as usize;

        if len == 0 {
            return Ok(StreamIter {
                data: Backing::Mapped(Arc::new(empty_mmap()?)),
                cursor: 0,
                end: 0,
                stop_offset: 0,
                first_nonzero: 0,
                first_record: true,
            });
        }

        let first_data = unsafe { libc::lseek(fd, 0, libc::SEEK_DATA) };
        let first_data = if first_data < 0 { 0usize } else { first_data as usize };

        // `fd` is borrowed, not owned: wrap it in a `File` only long
        // enough to hand it to `Mmap::map`, then forget the `File`
        // without closing the descriptor.
        let borrowed = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
        let mmap = unsafe { memmap2::Mmap::map(&*borrowed) }.map_err(StreamError::Io)?;
        let mut first_nonzero = first_data.min(mmap.len());
        while first_nonzero < mmap.len() && mmap[first_nonzero] == 0 {
            first_nonzero += 1;
        }

        trace!(
            "mapped {len} bytes, first_data={first_data} first_nonzero={first_nonzero}"
        );

        Ok(StreamIter {
            data: Backing::Mapped(Arc::new(mmap)),
            cursor: first_nonzero,
            end: len,
            stop_offset: len,
            first_nonzero,
            first_record: true,
        })
    }

    /// Total size of the backing range.
    pub fn size(&self) -> usize {
        self.end
    }

    /// Positions the cursor at `offset` (relative to the start of the
    /// backing range).
    ///
    /// Rejects offsets before the first non-zero byte or after the
    /// current stop point. If `offset` lands exactly on the first
    /// non-zero byte, the iterator resumes as if it were reading the
    /// very first record; otherwise it must resynchronise on the next
    /// marker.
    pub fn locate_at(&mut self, offset: usize) -> Result<(), StreamError> {
        if offset < self.first_nonzero || offset > self.stop_offset {
            return Err(StreamError::Internal(format!(
                "locate_at({offset}) outside [{}, {}]",
                self.first_nonzero, self.stop_offset
            )));
        }
        self.cursor = offset;
        self.first_record = offset == self.first_nonzero;
        Ok(())
    }

    /// Clamps the stop point to `offset`, if within range.
    ///
    /// A record is yielded as long as its first byte lies in
    /// `[cursor, stop_at)`, even if the record's body extends past it —
    /// see [`next`](Self::next).
    pub fn stop_at(&mut self, offset: usize) {
        if offset <= self.end {
            self.stop_offset = offset;
        }
    }

    /// Returns the next valid record, or `None` once the iterator has
    /// exhausted its range.
    ///
    /// Scans for markers, decodes candidates, and validates their CRC;
    /// any candidate that fails any check is skipped and the scan
    /// resumes from where it left off, per the self-synchronising
    /// contract in `spec.md` §7.
    pub fn next(&mut self) -> Option<(u32, Vec<u8>)> {
        let data = self.data.as_slice();

        loop {
            if self.cursor >= self.stop_offset {
                self.cursor = self.end;
                return None;
            }

            let encoded_start;
            if self.first_record {
                encoded_start = self.cursor;
                self.first_record = false;
            } else {
                let first_header = self.cursor + marker_find(&data[self.cursor..self.end]);
                if first_header >= self.stop_offset {
                    self.cursor = self.end;
                    return None;
                }
                encoded_start = first_header + 2;
            }

            if encoded_start > self.end {
                self.cursor = self.end;
                return None;
            }

            let next_marker = encoded_start + marker_find(&data[encoded_start..self.end]);
            self.cursor = next_marker;

            let encoded = &data[encoded_start..next_marker];
            match validate_candidate(encoded) {
                Ok((generation, payload)) => return Some((generation, payload)),
                Err(e) => {
                    trace!("skipping candidate at {encoded_start}: {e:?}");
                    continue;
                }
            }
        }
    }
}

fn validate_candidate(encoded: &[u8]) -> Result<(u32, Vec<u8>), CandidateError> {
    if encoded.len() > MAX_READ {
        return Err(CandidateError::TooLarge);
    }
    let decoded = decode(encoded).map_err(CandidateError::Decode)?;
    if decoded.len() < RECORD_HEADER_LEN {
        return Err(CandidateError::TooShort);
    }

    let stored_crc = u32::from_le_bytes(decoded[0..4].try_into().unwrap());
    let mut check = decoded.clone();
    check[0..4].copy_from_slice(&CRC_SENTINEL.to_le_bytes());
    let computed = crc32c::crc32c(&check);
    if computed != stored_crc {
        return Err(CandidateError::ChecksumMismatch);
    }

    let generation = u32::from_le_bytes(decoded[4..8].try_into().unwrap());
    let payload = decoded[RECORD_HEADER_LEN..].to_vec();
    Ok((generation, payload))
}

fn empty_mmap() -> Result<memmap2::Mmap, StreamError> {
    // memmap2 refuses to map a zero-length file; use an anonymous
    // zero-length mapping so `StreamIter` always has a `Mmap` to hold,
    // keeping `Backing` free of an extra variant just for this case.
    let anon = memmap2::MmapOptions::new().len(0).map_anon()?;
    Ok(anon.make_read_only()?)
}

/// Splits a file into `workers` disjoint byte ranges and returns one
/// iterator per partition, each already positioned via
/// [`StreamIter::locate_at`] / [`StreamIter::stop_at`].
///
/// Every record is assigned to exactly the partition containing its
/// *first* byte, even when the record's body crosses a partition
/// boundary (`spec.md` §4.D "Parallel replay"). A leading sparse hole
/// means the raw `w * chunk` arithmetic can place several partitions'
/// nominal start before `first_nonzero`; only the first partition whose
/// raw range actually reaches past the hole claims the leading record
/// (resuming at `first_nonzero` with `first_record` set) — every earlier
/// partition degenerates to an empty range instead of also being pulled
/// forward to `first_nonzero`, which would otherwise hand the same
/// leading record to more than one worker.
pub fn replay_partitioned(fd: RawFd, workers: usize) -> Result<Vec<StreamIter<'static>>, StreamError> {
    if workers == 0 {
        return Err(StreamError::Internal("replay_partitioned: workers must be >= 1".into()));
    }
    let base = StreamIter::init_fd(fd)?;
    let size = base.size();
    let first_nonzero = base.first_nonzero;
    let chunk = size.div_ceil(workers).max(1);

    let mut partitions = Vec::with_capacity(workers);
    let mut claimed_leading_hole = false;
    for w in 0..workers {
        let raw_start = w * chunk;
        let raw_end = ((w + 1) * chunk).min(size);
        let is_last = w == workers - 1;

        let (start, end) = if raw_start >= first_nonzero {
            (raw_start, raw_end)
        } else if !claimed_leading_hole && (raw_end > first_nonzero || is_last) {
            claimed_leading_hole = true;
            (first_nonzero, raw_end.max(first_nonzero))
        } else {
            // Entirely inside the leading hole and some other partition
            // already claims (or will claim) the first real record.
            (first_nonzero, first_nonzero)
        };

        let mut it = base.clone();
        it.locate_at(start)?;
        it.stop_at(end);
        partitions.push(it);
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{append_buf, append_initial, write_buf, write_initial};
    use std::io::Cursor;
    use std::os::unix::io::AsRawFd;
    use tempfile::tempfile;

    fn build_stream(records: &[(u32, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        write_initial(&mut cursor).unwrap();
        for (gen, payload) in records {
            write_buf(&mut cursor, *gen, payload).unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut it = StreamIter::init_buf(&[]);
        assert!(it.next().is_none());
    }

    #[test]
    fn round_trips_in_memory_records() {
        let records: Vec<(u32, &[u8])> = vec![(1, b"a"), (2, b""), (3, b"hello world")];
        let bytes = build_stream(&records);
        let mut it = StreamIter::init_buf(&bytes);

        for (gen, payload) in &records {
            let (g, p) = it.next().expect("record");
            assert_eq!(g, *gen);
            assert_eq!(&p, payload);
        }
        assert!(it.next().is_none());
    }

    #[test]
    fn single_byte_corruption_skips_only_that_record() {
        let records: Vec<(u32, &[u8])> = vec![(1, b"first"), (2, b"second"), (3, b"third")];
        let mut bytes = build_stream(&records);

        // Corrupt a byte squarely inside record 2's payload region.
        let marker_pos = bytes
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] == 0xFE && w[1] == 0xFD)
            .nth(1)
            .unwrap()
            .0;
        bytes[marker_pos + 3] ^= 0xFF;

        let mut it = StreamIter::init_buf(&bytes);
        let (g1, p1) = it.next().unwrap();
        assert_eq!(g1, 1);
        assert_eq!(&p1, b"first");

        let (g3, p3) = it.next().unwrap();
        assert_eq!(g3, 3);
        assert_eq!(&p3, b"third");

        assert!(it.next().is_none());
    }

    #[test]
    fn truncated_tail_yields_complete_prior_records() {
        let records: Vec<(u32, &[u8])> = vec![(10, b"alpha"), (11, b"beta"), (12, b"gamma")];
        let bytes = build_stream(&records);

        for cut in (0..bytes.len()).rev() {
            let partial = &bytes[..cut];
            let mut it = StreamIter::init_buf(partial);
            let mut count = 0;
            while it.next().is_some() {
                count += 1;
            }
            assert!(count <= records.len());
        }
    }

    #[test]
    fn fd_backed_iterator_skips_leading_sparse_hole() {
        let file = tempfile().unwrap();
        let fd = file.as_raw_fd();
        append_initial(fd, None).unwrap();
        append_buf(fd, 99, b"payload", None).unwrap();

        let mut it = StreamIter::init_fd(fd).unwrap();
        let (g, p) = it.next().unwrap();
        assert_eq!(g, 99);
        assert_eq!(&p, b"payload");
        assert!(it.next().is_none());
    }

    #[test]
    fn partitioning_with_leading_hole_does_not_duplicate_leading_record() {
        use std::io::{Seek, SeekFrom};

        // A 10_000-byte leading sparse hole ahead of the real data: raw
        // `w * chunk` arithmetic would otherwise clamp more than one
        // partition's start forward to `first_nonzero`, handing the
        // leading record to every one of them.
        let mut file = tempfile().unwrap();
        let hole = 10_000u64;
        file.set_len(hole).unwrap();
        file.seek(SeekFrom::Start(hole)).unwrap();
        let fd = file.as_raw_fd();
        append_initial(fd, None).unwrap();
        for i in 0..30u32 {
            append_buf(fd, i, format!("rec-{i}").as_bytes(), None).unwrap();
        }

        let mut sequential = StreamIter::init_fd(fd).unwrap();
        let mut expected = Vec::new();
        while let Some(rec) = sequential.next() {
            expected.push(rec);
        }
        assert_eq!(expected.len(), 30);

        for workers in [1usize, 2, 3, 4, 7] {
            let partitions = replay_partitioned(fd, workers).unwrap();
            let mut actual = Vec::new();
            for mut part in partitions {
                while let Some(rec) = part.next() {
                    actual.push(rec);
                }
            }
            actual.sort_by_key(|(g, _)| *g);
            assert_eq!(actual, expected, "workers={workers}");
        }
    }

    #[test]
    fn partitioning_yields_each_record_exactly_once() {
        let file = tempfile().unwrap();
        let fd = file.as_raw_fd();
        append_initial(fd, None).unwrap();
        for i in 0..20u32 {
            append_buf(fd, i, format!("record-{i}").as_bytes(), None).unwrap();
        }

        let partitions = replay_partitioned(fd, 4).unwrap();
        let mut seen = Vec::new();
        for mut part in partitions {
            while let Some((gen, payload)) = part.next() {
                seen.push((gen, payload));
            }
        }
        seen.sort_by_key(|(g, _)| *g);
        assert_eq!(seen.len(), 20);
        for (i, (gen, payload)) in seen.iter().enumerate() {
            assert_eq!(*gen, i as u32);
            assert_eq!(payload, format!("record-{i}").as_bytes());
        }
    }
}
