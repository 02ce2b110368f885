//! # stuffed-record-stream
//!
//! A resilient, self-synchronising binary record stream for append-only
//! logs, built from two layered components:
//!
//! - A **word-stuffing codec** ([`codec`]) that re-encodes a byte buffer
//!   so a reserved 2-byte marker never occurs inside it, using a
//!   run-length scheme whose headers can never themselves spell the
//!   marker.
//! - A **record framer and stream iterator** ([`framer`], [`stream`])
//!   that wraps payloads in a CRC32C-protected header, appends them to a
//!   file with OS-level atomicity guarantees, and replays them back with
//!   a scanning iterator that re-synchronises past any corruption it
//!   finds instead of surfacing it as an error.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`marker`] | Locates the reserved 2-byte marker inside a buffer |
//! | [`codec`] | Word-stuffing encoder/decoder built around the marker |
//! | [`error`] | Error types shared by the write and replay paths |
//! | [`framer`] | Frames payloads into records and appends them to a stream |
//! | [`stream`] | Scans a buffer or memory-mapped file for valid records |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::fs::OpenOptions;
//! use std::os::unix::io::AsRawFd;
//! use stuffed_record_stream::framer::{append_initial, append_buf};
//! use stuffed_record_stream::stream::StreamIter;
//!
//! let file = OpenOptions::new()
//!     .create(true)
//!     .append(true)
//!     .read(true)
//!     .open("/tmp/records.log")
//!     .unwrap();
//! let fd = file.as_raw_fd();
//!
//! append_initial(fd, None).unwrap();
//! append_buf(fd, 1, b"hello world", None).unwrap();
//!
//! let mut it = StreamIter::init_fd(fd).unwrap();
//! while let Some((generation, payload)) = it.next() {
//!     println!("generation {generation}: {} bytes", payload.len());
//! }
//! ```

#![allow(dead_code)]

pub mod codec;
pub mod error;
pub mod framer;
pub mod marker;
pub mod stream;

pub use error::{DecodeError, StreamError};
pub use framer::{append_buf, append_initial, write_buf, write_initial, Frameable};
pub use marker::MARKER;
pub use stream::StreamIter;

/// Maximum payload size accepted by [`framer::append_buf`] /
/// [`framer::write_buf`], in bytes.
pub const MAX_WRITE: usize = 512;

/// Maximum *encoded* candidate length the stream iterator will attempt
/// to decode before rejecting it outright as too large to be a genuine
/// record (`spec.md` §4.D).
pub const MAX_READ: usize = 1024;

/// Length, in bytes, of the fixed in-record header: a 4-byte CRC32C
/// followed by a 4-byte generation counter, both little-endian.
pub const RECORD_HEADER_LEN: usize = 8;

/// Sentinel value the CRC field is filled with before the checksum
/// itself is computed, so an all-zero record never accidentally
/// produces a matching checksum.
pub const CRC_SENTINEL: u32 = 0xFFFF_FFFF;
