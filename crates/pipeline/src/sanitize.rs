//! Stripping control characters from part content before it reaches a filter.
//!
//! Content is decoded as UTF-8 one code point at a time. Malformed sequences
//! are kept as-is (they cannot be a control character) and scanning carries
//! on past them.

/// Whether a decoded character is removed: C0 controls other than `\n` and
/// `\r`, DEL, and ZERO WIDTH SPACE.
#[must_use]
pub fn is_stripped(ch: char) -> bool {
    (ch < ' ' && ch != '\n' && ch != '\r') || ch == '\u{7f}' || ch == '\u{200b}'
}

/// Remove stripped characters from `buf` in place and return the new length.
///
/// Each removal shifts the tail of the buffer left over the removed bytes.
/// Scanning resumes at the shift point, or at the start of a malformed
/// sequence directly before it, since the removal may have completed that
/// sequence. Running this twice leaves the buffer unchanged the second time.
pub fn sanitize_in_place(buf: &mut Vec<u8>) -> usize {
    let mut cursor = 0;
    // Start of the previous sequence when it failed to decode.
    let mut malformed_at: Option<usize> = None;

    while cursor < buf.len() {
        let (ch, width) = bstr::decode_utf8(&buf[cursor..]);
        match ch {
            Some(ch) if is_stripped(ch) => {
                buf.copy_within(cursor + width.., cursor);
                buf.truncate(buf.len() - width);
                if let Some(start) = malformed_at.take() {
                    cursor = start;
                }
            },
            Some(_) => {
                malformed_at = None;
                cursor += width;
            },
            None => {
                malformed_at = Some(cursor);
                cursor += width.max(1);
            },
        }
    }

    buf.len()
}

/// Sanitized copy of `content`, leaving the original untouched.
#[must_use]
pub fn sanitized(content: &[u8]) -> Vec<u8> {
    let mut out = content.to_vec();
    sanitize_in_place(&mut out);
    out
}
