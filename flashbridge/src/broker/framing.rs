//! Line framing of raw serial chunks.

/// Longest partial line kept before it is emitted anyway.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                if let Some(invalid_len) = err.error_len() {
                    output.push('\u{FFFD}');
                    let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                    buffer.drain(..drain_to);
                } else {
                    buffer.drain(..valid_up_to);
                    break;
                }
            },
        }
    }

    output
}

/// Splits a byte stream into text lines.
///
/// Lines end at `\n`; a trailing `\r` is dropped. Bytes of a multi-byte
/// character split across chunks are held until the rest arrives.
#[derive(Debug, Default)]
pub struct LineFramer {
    bytes: Vec<u8>,
    line: String,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let text = drain_utf8_lossy(&mut self.bytes);

        let mut lines = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                lines.push(self.take_line());
            } else {
                self.line.push(ch);
                if self.line.len() >= MAX_LINE_LEN {
                    lines.push(self.take_line());
                }
            }
        }
        lines
    }

    /// Return the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        if !self.bytes.is_empty() {
            self.line
                .push_str(&String::from_utf8_lossy(&std::mem::take(&mut self.bytes)));
        }
        if self.line.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let mut line = std::mem::take(&mut self.line);
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Filter non-printable control characters for terminal display.
///
/// Keeps `\t` and printable characters.
pub fn clean_line(text: &str) -> String {
    text.chars()
        .filter(|ch| *ch == '\t' || !ch.is_control())
        .collect()
}
