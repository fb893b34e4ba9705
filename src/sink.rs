//! Response-body sink (spec §4.12).
//!
//! Operates on the growable buffer already carried by [`ResponseState`]
//! (see [`crate::context::reserve_with_growth_policy`]) rather than a
//! separate owned type, since the context's body *is* the sink's backing
//! store per spec §4.12 ("backed by a growable byte buffer on the
//! context").

use crate::context::ResponseState;
use thiserror::Error;

const SNIFFED_TYPES: [&str; 3] = ["text/html", "text/plain", "application/json"];

/// Sniffs the `Content-Type` response header for a short allowlist of
/// text-like MIME types and records the `likely_utf8` hint (spec §4.12:
/// "affects capacity pre-sizing only").
pub fn sniff_content_type(response: &mut ResponseState) {
    if let Some(content_type) = response.headers.get("Content-Type") {
        let base = content_type.split(';').next().unwrap_or("").trim();
        response.likely_utf8 = SNIFFED_TYPES.iter().any(|&t| t.eq_ignore_ascii_case(base));
    }
}

/// Writes `bytes` to the sink, sniffing `Content-Type` on the very first
/// write (spec §4.12).
pub fn write(response: &mut ResponseState, bytes: &[u8]) {
    if response.body.is_empty() {
        sniff_content_type(response);
    }
    response.push_body(bytes);
    response.pos = response.body.len();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("seek offset is past the end of the buffer")]
    OutOfRange,
}

/// Seeks to `offset` from the start of the buffer, used only to truncate
/// for error responses (spec §4.12: "Seek is restricted to `SEEK_SET`
/// with offsets in `[0, len]`").
pub fn seek_set(response: &mut ResponseState, offset: usize) -> Result<(), SeekError> {
    if offset > response.body.len() {
        return Err(SeekError::OutOfRange);
    }
    response.body.truncate(offset);
    response.pos = offset;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_content_type() {
        let mut r = ResponseState::default();
        r.headers.insert("Content-Type", "application/json; charset=utf-8".to_string());
        write(&mut r, b"{}");
        assert!(r.likely_utf8);
    }

    #[test]
    fn unknown_content_type_is_not_flagged() {
        let mut r = ResponseState::default();
        r.headers.insert("Content-Type", "image/png".to_string());
        write(&mut r, b"\x89PNG");
        assert!(!r.likely_utf8);
    }

    #[test]
    fn seek_truncates_within_range() {
        let mut r = ResponseState::default();
        write(&mut r, b"hello world");
        seek_set(&mut r, 5).unwrap();
        assert_eq!(r.body, b"hello");
    }

    #[test]
    fn seek_past_end_fails() {
        let mut r = ResponseState::default();
        write(&mut r, b"hi");
        assert_eq!(seek_set(&mut r, 10), Err(SeekError::OutOfRange));
    }
}
