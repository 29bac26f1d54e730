//! MMI / USSD code validation.

/// Returned by the checked USSD call instead of transmitting an invalid code.
pub const INVALID_MMI: &str = "ERROR: Invalid MMI code";

/// Whether `code` is a well-formed MMI code: at least 3 characters, starts
/// with `*`, ends with `#`, and every character in between is a digit, `*`
/// or `+`.
#[must_use]
pub fn is_valid_mmi(code: &str) -> bool {
    let bytes = code.as_bytes();
    if bytes.len() < 3 {
        return false;
    }
    let (Some(b'*'), Some(b'#')) = (bytes.first(), bytes.last()) else {
        return false;
    };
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|&c| c.is_ascii_digit() || c == b'*' || c == b'+')
}
