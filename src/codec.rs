//! Word-stuff codec — component B.
//!
//! A self-synchronising code: re-encodes an arbitrary byte buffer so that
//! the 2-byte [`MARKER`](crate::marker::MARKER) never occurs in the
//! encoded body, using a run-length scheme with a 1-byte header for the
//! first run of a record and 2-byte little-endian base-[`RADIX`] headers
//! for every run after that. See `spec.md` §4.B for the full derivation;
//! this module follows it, resolved against the worked examples in §8
//! where the prose and the examples could be read two ways (the
//! concrete byte sequences in §8 are authoritative — an implementation
//! must round-trip every one of them exactly).

use crate::error::DecodeError;
use crate::marker::{marker_find, MARKER, RADIX};

/// Maximum length of the first run in a record (`R - 1`).
pub const CAP_FIRST: usize = RADIX as usize - 1;

/// Maximum length of any run after the first (`R*R - 1`).
pub const CAP_SUBSEQUENT: usize = RADIX as usize * RADIX as usize - 1;

/// Computes the exact worst-case encoded size for an `n`-byte input,
/// following `spec.md`'s `BOUND(k) = 2 + k + 2*(2 + floor(k / (R^2-1)))`.
///
/// `include_header` adds the 8-byte in-record header (CRC + generation)
/// to `k` before computing the bound, for callers sizing a buffer for a
/// complete framed record rather than a bare payload.
///
/// Returns `None` on overflow (mirrors the C `OVERFLOW` sentinel for
/// `n > SSIZE_MAX`).
pub fn stuffed_bound(n: usize, include_header: bool) -> Option<usize> {
    if n > isize::MAX as usize {
        return None;
    }
    let k = if include_header {
        n.checked_add(crate::RECORD_HEADER_LEN)?
    } else {
        n
    };
    if k > isize::MAX as usize {
        return None;
    }
    let header_runs = k / CAP_SUBSEQUENT;
    let headers = 2usize.checked_mul(2usize.checked_add(header_runs)?)?;
    2usize.checked_add(k)?.checked_add(headers)
}

/// Encodes `src`, returning a freshly allocated buffer that ends with the
/// trailing marker.
///
/// No occurrence of the marker appears anywhere in the returned buffer
/// except its final 2 bytes.
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stuffed_bound(src.len(), false).unwrap_or(src.len() + 4));
    encode_into(src, &mut out);
    out
}

/// Encodes `src` into `out`, appending to whatever `out` already
/// contains. Returns the number of bytes appended (encoded body plus
/// trailing marker).
pub fn encode_into(src: &[u8], out: &mut Vec<u8>) -> usize {
    let start_len = out.len();
    let mut pos = 0usize;
    let mut first = true;

    loop {
        let cap = if first { CAP_FIRST } else { CAP_SUBSEQUENT };
        let remaining_before = src.len() - pos;
        let window = remaining_before.min(cap);
        let run = marker_find(&src[pos..pos + window]);

        if first {
            out.push(run as u8);
        } else {
            out.push((run % RADIX as usize) as u8);
            out.push((run / RADIX as usize) as u8);
        }
        out.extend_from_slice(&src[pos..pos + run]);
        pos += run;

        let remaining_after = src.len() - pos;
        if remaining_after == 0 {
            // Either the run ran out of real data before hitting the cap
            // (the virtual terminator is consumed here), or it hit the
            // cap exactly as the last byte of input was reached — either
            // way there is nothing left to encode.
            break;
        }

        if run < cap {
            // A real marker was found inside the window; it is never
            // written to `out`, only skipped over.
            debug_assert_eq!(&src[pos..pos + 2], &MARKER);
            pos += 2;
        }
        // If run == cap, the window was exhausted without finding a
        // marker; continue straight into the next block with no bytes
        // consumed beyond the run itself.
        first = false;
    }

    crate::marker::write_marker(out);
    out.len() - start_len
}

/// Decodes an encoded record body (not including the trailing marker —
/// the caller delimits `src` at the next marker or end-of-data).
pub fn decode(src: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0usize;
    let mut first = true;

    loop {
        if !first {
            if src.len() - pos == 0 {
                return Ok(out);
            }
        }

        let cap = if first { CAP_FIRST } else { CAP_SUBSEQUENT };

        let run = if first {
            if src.len() - pos < 1 {
                return Err(DecodeError::Truncated);
            }
            let r = src[pos] as usize;
            pos += 1;
            r
        } else {
            if src.len() - pos < 2 {
                return Err(DecodeError::Truncated);
            }
            let lo = src[pos] as usize;
            let hi = src[pos + 1] as usize;
            pos += 2;
            lo + hi * RADIX as usize
        };

        if run > cap {
            return Err(DecodeError::RunTooLong);
        }
        let remaining_input = src.len() - pos;
        if run > remaining_input {
            return Err(DecodeError::RunExceedsInput);
        }

        out.extend_from_slice(&src[pos..pos + run]);
        pos += run;

        let remaining_input = src.len() - pos;
        if remaining_input == 0 {
            return Ok(out);
        }

        if run < cap {
            if remaining_input < 2 {
                return Err(DecodeError::MissingHeader);
            }
            out.extend_from_slice(&MARKER);
        }
        // run == cap: no marker inserted, loop directly into the next
        // header (checked for EOF at the top, above).
        first = false;
    }
}
