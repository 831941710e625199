//! Request-scoped scan accounting.
//!
//! Counts decompressed bytes consumed by the tokenizer across every opened
//! segment. The total is what a request is billed for.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanCounter {
    bytes: u64,
    segments: u32,
}

impl ScanCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the bytes consumed from one opened segment.
    pub fn add_segment(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.segments += 1;
    }

    /// Total decompressed bytes read.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of segments that were opened and read from.
    pub fn segments(&self) -> u32 {
        self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_segment() {
        let mut c = ScanCounter::new();
        c.add_segment(41);
        c.add_segment(0);
        c.add_segment(9);
        assert_eq!(c.bytes(), 50);
        assert_eq!(c.segments(), 3);
    }
}
