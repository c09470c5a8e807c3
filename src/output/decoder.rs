/// Turns raw pipe reads into text without splitting multi-byte UTF-8
/// sequences across chunks. Invalid bytes are replaced, not dropped.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    carry: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let split = self.carry.len() - incomplete_tail_len(&self.carry);
        let text = String::from_utf8_lossy(&self.carry[..split]).into_owned();
        self.carry.drain(..split);
        text
    }

    /// Flushes whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for idx in (start..bytes.len()).rev() {
        let byte = bytes[idx];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - idx;
        return if have < needed { have } else { 0 };
    }
    0
}
