use serde::Serialize;

/// Default retention for one step's streamed output.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Append-only output text for one running step.
///
/// Holds at most `max_bytes`; on overflow the oldest text is dropped at a
/// character boundary and the buffer remembers it was truncated.
#[derive(Debug, Clone, Serialize)]
pub struct OutputBuffer {
    text: String,
    max_bytes: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);

        if self.text.len() > self.max_bytes {
            let mut cut = self.text.len() - self.max_bytes;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_chunks() {
        let mut buffer = OutputBuffer::default();
        buffer.push("compiling\n");
        buffer.push("done\n");
        assert_eq!(buffer.as_str(), "compiling\ndone\n");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn test_drops_oldest_text_on_overflow() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push("abcdef");
        buffer.push("ghij");
        assert_eq!(buffer.as_str(), "cdefghij");
        assert!(buffer.is_truncated());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut buffer = OutputBuffer::new(4);
        // "é" is two bytes; cutting one byte in would split it.
        buffer.push("éabc");
        buffer.push("d");
        assert_eq!(buffer.as_str(), "abcd");
        assert!(buffer.as_str().len() <= 4);
    }
}
