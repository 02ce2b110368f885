//! Error types shared across the codec, framer, and stream iterator.
//!
//! Mirrors the shape of the predecessor's `WalError`, split so that the
//! kinds `spec.md` §7 says must *never* surface to a caller (malformed
//! runs, CRC mismatches) stay internal to the iterator instead of living
//! in the public enum.

use thiserror::Error;

/// Errors returned by the write-side and stream-management operations.
///
/// Deliberately does **not** contain a variant for decode failure or CRC
/// mismatch: per `spec.md` §7, "the read path never surfaces corruption
/// as an error" — invalid candidate records are silently skipped by the
/// iterator, not reported here.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Payload exceeds [`crate::MAX_WRITE`] on append.
    #[error("payload of {0} bytes exceeds the maximum write size")]
    InputTooLarge(usize),

    /// Underlying I/O failure (`write`, `writev`, `lseek`, `read`, `fstat`, `mmap`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write completed short after all retries were exhausted.
    #[error("short write: wrote {written} of {expected} expected bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Internal consistency error (e.g. a poisoned lock or an invariant
    /// the codec itself is supposed to guarantee).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a candidate encoded run failed to decode.
///
/// Corresponds to `spec.md` §4.B "Failure conditions". Public so that
/// tests can assert on precise rejection reasons (§8 "Decode rejects
/// malformed"), even though the stream iterator itself only ever logs
/// these at `trace` level and otherwise treats them uniformly as "skip
/// this candidate".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before a required header byte.
    #[error("truncated input: missing run-length header")]
    Truncated,
    /// A run-length digit exceeded its cap for that position.
    #[error("run length exceeds cap for this position")]
    RunTooLong,
    /// A run claims more literal bytes than remain in the input.
    #[error("run length exceeds remaining input")]
    RunExceedsInput,
    /// A short run (< cap) left fewer than 2 bytes for the next header.
    #[error("insufficient bytes remaining for the next run header")]
    MissingHeader,
}

/// Internal reason a candidate record was rejected by the stream iterator.
///
/// Never escapes the crate; used only to decide "skip and continue" and
/// to log at `trace!` why a given byte range was not a valid record.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CandidateError {
    TooLarge,
    Decode(DecodeError),
    TooShort,
    ChecksumMismatch,
}
