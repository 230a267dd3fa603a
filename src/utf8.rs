//! UTF-8 validation for text payloads
//!
//! Complete messages go through the `simdutf8` basic validator. Fragmented text is
//! checked with the compat validator, which tells a truncated trailing sequence (more
//! fragments may complete it) apart from a genuinely invalid one.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate a UTF-8 prefix that may end inside a multi-byte sequence
///
/// Returns `(valid, incomplete)`: `valid` is false only for bytes that can never become
/// UTF-8, `incomplete` is true when the tail is an unfinished sequence.
#[inline]
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, bool) {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => (true, false),
        Err(e) => match e.error_len() {
            None => (true, true),
            Some(_) => (false, false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_and_invalid() {
        assert!(validate_utf8(b"hello"));
        assert!(validate_utf8("héllo wörld".as_bytes()));
        assert!(!validate_utf8(&[0xff, 0xfe]));
    }

    #[test]
    fn test_incomplete_tail() {
        let euro = "€".as_bytes();
        assert_eq!(validate_utf8_incomplete(&euro[..2]), (true, true));
        assert_eq!(validate_utf8_incomplete(euro), (true, false));
        assert_eq!(validate_utf8_incomplete(&[b'a', 0xc0, b'b']), (false, false));
    }
}
