/// Incremental UTF-8 decoder for log chunks.
///
/// Fixed-size reads split multi-byte characters at arbitrary points. The
/// unfinished tail of a chunk is held back and prepended to the next one, so
/// a split character is never turned into U+FFFD. Bytes that are invalid on
/// their own still are.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as can be decoded now.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is still held back. Called once the source has ended.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Length of a trailing, not yet complete, multi-byte sequence.
///
/// Only the last three bytes can belong to one: a sequence is at most four.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
