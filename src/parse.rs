//! Substring extractors for AT reply text.
//!
//! These mirror the modem's own loose formatting: locate a marker, then pick
//! fields by quote or comma position. Nothing here panics on malformed input;
//! missing delimiters yield `None` (or `-1` for the HTTP status).

/// Marker preceding the HTTP action result.
pub const HTTP_ACTION_MARKER: &str = "+HTTPACTION:";

/// The `n`th (0-based) double-quoted substring of `line`.
///
/// `+CLIP: "+15551234567",129` → field 0 is `+15551234567`.
/// Returns `None` when the `n`th quote pair is not closed.
#[must_use]
pub fn quoted_field(line: &str, n: usize) -> Option<&str> {
    let mut parts = line.split('"');
    // split yields: before, q0, between, q1, between, ...
    let field = parts.nth(2 * n + 1)?;
    // A trailing unclosed quote still produces a segment; require a closing one.
    parts.next()?;
    Some(field)
}

/// Message index from `+CMTI: "SM",3`: the integer after the last comma.
#[must_use]
pub fn message_index(line: &str) -> Option<u32> {
    let (_, tail) = line.rsplit_once(',')?;
    tail.trim().parse().ok()
}

/// HTTP status from an `AT+HTTPACTION` reply.
///
/// Finds `+HTTPACTION:`, then the text between the first and second comma
/// after it (`+HTTPACTION: 0,200,1234` → `200`). Returns `-1` if the marker
/// or either comma is missing, or the field is not an integer.
#[must_use]
pub fn http_status(response: &str) -> i32 {
    let Some(idx) = response.find(HTTP_ACTION_MARKER) else {
        return -1;
    };
    let rest = &response[idx..];
    let Some((_, after_first)) = rest.split_once(',') else {
        return -1;
    };
    let Some((code, _)) = after_first.split_once(',') else {
        return -1;
    };
    code.trim().parse().unwrap_or(-1)
}

/// Parse `AT+CSQ` response → RSSI in dBm.
pub fn parse_csq(response: &str) -> Result<i32, String> {
    let line = response
        .lines()
        .find(|l| l.contains("+CSQ:"))
        .ok_or_else(|| format!("no +CSQ in response: {}", response.trim()))?;

    let data = line.split(':').nth(1).ok_or("malformed +CSQ line")?.trim();

    let rssi_raw: i32 = data
        .split(',')
        .next()
        .ok_or("no RSSI value")?
        .trim()
        .parse()
        .map_err(|e| format!("bad RSSI: {e}"))?;

    if rssi_raw == 99 {
        return Err("RSSI not detectable (99)".into());
    }

    Ok(-113 + 2 * rssi_raw)
}

/// Parse `AT+COPS?` → operator name.
///
/// Response: `+COPS: 0,0,"T-Mobile",7`
#[must_use]
pub fn parse_cops(response: &str) -> Option<String> {
    let line = response.lines().find(|l| l.contains("+COPS:"))?;
    let name = quoted_field(line, 0)?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
