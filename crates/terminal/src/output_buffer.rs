use parking_lot::Mutex;

/// Append-only byte accumulator between a shell pump and its poller.
///
/// Growth is bounded only by how often the buffer is drained. A stalled
/// poller means unbounded growth; nothing is ever truncated.
#[derive(Default)]
pub struct OutputBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        self.bytes.lock().extend_from_slice(data);
    }

    /// Take everything buffered so far.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock())
    }

    /// Take everything buffered so far as text.
    ///
    /// Invalid sequences are replaced with U+FFFD. A multi-byte character
    /// cut off at the end of the buffer stays buffered until its remaining
    /// bytes arrive.
    pub fn drain_text(&self) -> String {
        let head = {
            let mut bytes = self.bytes.lock();
            let keep = incomplete_suffix_len(&bytes);
            let len = bytes.len();
            let tail = bytes.split_off(len - keep);
            std::mem::replace(&mut *bytes, tail)
        };
        match String::from_utf8(head) {
            Ok(text) => text,
            Err(error) => String::from_utf8_lossy(error.as_bytes()).into_owned(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }
}

/// Length of a trailing UTF-8 sequence that is valid so far but unfinished.
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
