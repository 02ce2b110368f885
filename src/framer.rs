//! Record framer — component C.
//!
//! Prefixes a caller payload with the fixed 8-byte record header
//! (CRC32C + generation), encodes it with the word-stuff codec, and
//! appends it to a stream. Two independent surfaces are provided,
//! mirroring `spec.md` §6's `append_*` / `write_*` split:
//!
//! - [`append_initial`] / [`append_buf`] operate on a raw `RawFd` opened
//!   in append mode, with the retry-on-short-write policy §4.C
//!   describes. This is the layer for file descriptors that may be
//!   shared across processes.
//! - [`write_initial`] / [`write_buf`] operate on any `Read + Write +
//!   Seek`, with no retry logic — for private temporary files where the
//!   caller owns synchronization.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::RawFd;

use libc::c_void;
use tracing::{error, trace, warn};

use crate::codec::encode_into;
use crate::error::StreamError;
use crate::marker::{write_marker, MARKER};
use crate::{CRC_SENTINEL, MAX_WRITE, RECORD_HEADER_LEN};

/// Caller-supplied error sink: a static message plus an OS-error-like code.
/// Passing `None` is legal and simply discards the report.
pub type ErrorSink<'a> = Option<&'a dyn Fn(&'static str, i32)>;

/// Maximum raw-fd write attempts before giving up (`spec.md` §4.C).
const RETRY_LIMIT: u32 = 3;

/// A type that can be packed into a scratch buffer for framing, in place
/// of baking a specific serialization format into this crate (`spec.md`
/// §1 places message (de)serialization out of scope).
pub trait Frameable {
    /// Upper bound on the packed size, used to size the scratch buffer.
    fn packed_size(&self) -> usize;
    /// Packs `self` into `dst`, returning the number of bytes written.
    fn pack(&self, dst: &mut [u8]) -> usize;
}

/// Builds the encoded bytes for one record: `[crc(4) || generation(4) ||
/// payload]`, CRC32C over the whole thing with the CRC field pre-filled
/// to the all-ones sentinel, then word-stuff encoded with a trailing
/// marker.
fn frame_record(generation: u32, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
    if payload.len() > MAX_WRITE {
        return Err(StreamError::InputTooLarge(payload.len()));
    }

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&CRC_SENTINEL.to_le_bytes());
    record.extend_from_slice(&generation.to_le_bytes());
    record.extend_from_slice(payload);

    let crc = crc32c::crc32c(&record);
    record[0..4].copy_from_slice(&crc.to_le_bytes());

    let mut encoded = Vec::new();
    encode_into(&record, &mut encoded);
    trace!(
        "framed record: generation={generation} payload_len={} encoded_len={} crc={crc:#010x}",
        payload.len(),
        encoded.len()
    );
    Ok(encoded)
}

// ----------------------------------------------------------------------
// Raw-fd layer
// ----------------------------------------------------------------------

/// Ensures `fd` ends with the marker before the first write to a
/// possibly-corrupt or pre-existing file. Does nothing if it already
/// does.
///
/// Probes via `lseek(SEEK_END, -2)` + `read`, matching `spec.md` §4.C.
pub fn append_initial(fd: RawFd, sink: ErrorSink<'_>) -> Result<(), StreamError> {
    let probe = unsafe { libc::lseek(fd, -2, libc::SEEK_END) };
    let already_terminated = probe >= 0 && {
        let mut tail = [0u8; 2];
        let n = unsafe { libc::read(fd, tail.as_mut_ptr() as *mut c_void, 2) };
        n == 2 && tail == MARKER
    };

    if already_terminated {
        trace!("stream already ends in the marker, skipping initial write");
        return Ok(());
    }

    let mut marker = Vec::with_capacity(2);
    write_marker(&mut marker);
    let n = unsafe { libc::write(fd, marker.as_ptr() as *const c_void, 2) };
    if n != 2 {
        let err = io::Error::last_os_error();
        let code = err.raw_os_error().unwrap_or(-1);
        error!("append_initial failed to write leading marker: {err}");
        if let Some(f) = sink {
            f("append_initial: write failed", code);
        }
        return Err(StreamError::Io(err));
    }
    Ok(())
}

/// Appends one record to the append-mode file descriptor `fd`.
///
/// Issues a single vectored write. On a short write, retries up to
/// [`RETRY_LIMIT`] times; from the second attempt on, an explicit 2-byte
/// marker is prepended to the outstanding bytes, since a racing writer
/// may already have consumed the trailing-marker guarantee the first
/// attempt relied on. If retries are exhausted with data still
/// outstanding, a best-effort marker-only write is issued so a future
/// reader sees a clean record boundary, and [`StreamError::ShortWrite`]
/// is returned.
pub fn append_buf(
    fd: RawFd,
    generation: u32,
    payload: &[u8],
    sink: ErrorSink<'_>,
) -> Result<(), StreamError> {
    let encoded = frame_record(generation, payload)?;
    let total = encoded.len();
    let mut offset = 0usize;
    let mut needs_marker_prefix = false;

    for attempt in 1..=RETRY_LIMIT {
        let body = &encoded[offset..];
        let marker_len = if needs_marker_prefix { 2usize } else { 0 };
        let iov = [
            libc::iovec {
                iov_base: MARKER.as_ptr() as *mut c_void,
                iov_len: marker_len,
            },
            libc::iovec {
                iov_base: body.as_ptr() as *mut c_void,
                iov_len: body.len(),
            },
        ];

        let n = unsafe { libc::writev(fd, iov.as_ptr(), 2) };
        if n < 0 {
            let err = io::Error::last_os_error();
            let code = err.raw_os_error().unwrap_or(-1);
            warn!("append_buf writev attempt {attempt} failed: {err}");
            if let Some(f) = sink {
                f("append_buf: writev failed", code);
            }
            continue;
        }

        let mut written = n as usize;
        if written == 0 {
            continue;
        }

        if written < marker_len {
            // Didn't even get the re-anchoring marker out; retry the
            // whole attempt unchanged.
            continue;
        }
        written -= marker_len;
        offset += written;

        if offset >= total {
            return Ok(());
        }

        warn!(
            "append_buf short write: {written} of {} bytes on attempt {attempt}, {} remaining",
            marker_len + body.len(),
            total - offset
        );
        needs_marker_prefix = true;
    }

    if offset < total {
        // Best-effort: leave a clean boundary marker for the next reader
        // or writer, ignoring failure.
        let _ = unsafe { libc::write(fd, MARKER.as_ptr() as *const c_void, 2) };
        let err = io::Error::last_os_error();
        let code = err.raw_os_error().unwrap_or(0);
        error!("append_buf exhausted retries with {} bytes outstanding", total - offset);
        if let Some(f) = sink {
            f("append_buf: exhausted retries after short write", code);
        }
        return Err(StreamError::ShortWrite {
            written: offset,
            expected: total,
        });
    }
    Ok(())
}

/// Packs `msg` into a scratch buffer and appends it via [`append_buf`].
pub fn append_msg<T: Frameable>(
    fd: RawFd,
    generation: u32,
    msg: &T,
    sink: ErrorSink<'_>,
) -> Result<(), StreamError> {
    let mut scratch = vec![0u8; msg.packed_size()];
    let n = msg.pack(&mut scratch);
    append_buf(fd, generation, &scratch[..n], sink)
}

// ----------------------------------------------------------------------
// Buffered-stream layer (no retry logic; private temporary files)
// ----------------------------------------------------------------------

/// Ensures `stream` ends with the marker, without any retry logic.
/// Intended for private temporary files the caller fully controls.
pub fn write_initial<S: Read + Write + Seek>(stream: &mut S) -> Result<(), StreamError> {
    let len = stream.seek(SeekFrom::End(0))?;
    if len >= 2 {
        stream.seek(SeekFrom::End(-2))?;
        let mut tail = [0u8; 2];
        stream.read_exact(&mut tail)?;
        if tail == MARKER {
            trace!("stream already ends in the marker, skipping initial write");
            return Ok(());
        }
    }
    stream.seek(SeekFrom::End(0))?;
    let mut marker = Vec::with_capacity(2);
    write_marker(&mut marker);
    stream.write_all(&marker)?;
    Ok(())
}

/// Appends one record to `stream` with no retry logic.
pub fn write_buf<S: Write + Seek>(
    stream: &mut S,
    generation: u32,
    payload: &[u8],
) -> Result<(), StreamError> {
    let encoded = frame_record(generation, payload)?;
    stream.write_all(&encoded)?;
    Ok(())
}

/// Packs `msg` into a scratch buffer and appends it via [`write_buf`].
pub fn write_msg<S: Write + Seek, T: Frameable>(
    stream: &mut S,
    generation: u32,
    msg: &T,
) -> Result<(), StreamError> {
    let mut scratch = vec![0u8; msg.packed_size()];
    let n = msg.pack(&mut scratch);
    write_buf(stream, generation, &scratch[..n])
}
