//! Incremental line framing for the modem byte stream.

/// Accumulates bytes until `\n`, then yields the line with trailing
/// whitespace (including the `\r` of a CRLF pair) trimmed.
///
/// An unterminated tail stays buffered across calls. The buffer is unbounded;
/// callers bound how long they keep feeding.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns the completed line when `b` is the terminator.
    pub fn feed(&mut self, b: u8) -> Option<String> {
        if b != b'\n' {
            self.buf.push(b);
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        Some(line)
    }

    /// Bytes of the current unterminated line.
    #[must_use]
    pub fn partial(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any unterminated tail.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
