use std::collections::VecDeque;

use bytes::Bytes;

/// Fixed-capacity FIFO of the most recent terminal output.
///
/// Pushing never fails and never waits: once full, the oldest bytes are
/// evicted to make room.
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes ever pushed, including evicted ones
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Whether anything has been evicted
    pub fn has_evicted(&self) -> bool {
        self.total_written > self.bytes.len() as u64
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;

        let data = if data.len() > self.capacity {
            self.bytes.clear();
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let excess = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if excess > 0 {
            self.bytes.drain(..excess);
        }
        self.bytes.extend(data);
    }

    /// Contiguous copy of the buffered bytes for replay.
    ///
    /// After eviction the oldest retained byte may sit in the middle of a
    /// UTF-8 sequence; those orphaned continuation bytes are skipped.
    pub fn snapshot(&self) -> Bytes {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);

        if self.has_evicted() {
            let skip = out
                .iter()
                .take(3)
                .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
                .count();
            out.drain(..skip);
        }
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_capacity_keeps_everything() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push(b"hello ");
        buffer.push(b"world");
        assert_eq!(&buffer.snapshot()[..], b"hello world");
        assert!(!buffer.has_evicted());
        assert_eq!(buffer.total_written(), 11);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push(b"abcdef");
        buffer.push(b"ghij");
        assert_eq!(&buffer.snapshot()[..], b"cdefghij");
        assert_eq!(buffer.len(), 8);
        assert!(buffer.has_evicted());
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(b"xy");
        buffer.push(b"0123456789");
        assert_eq!(&buffer.snapshot()[..], b"6789");
        assert_eq!(buffer.total_written(), 12);
    }

    #[test]
    fn test_snapshot_skips_split_utf8_after_eviction() {
        let mut buffer = OutputBuffer::new(4);
        // "é" is two bytes; eviction cuts it in half
        buffer.push("aé".as_bytes());
        buffer.push(b"xyz");
        assert_eq!(&buffer.snapshot()[..], b"xyz");
    }

    #[test]
    fn test_many_small_pushes_match_suffix() {
        let mut buffer = OutputBuffer::new(100);
        let mut all = Vec::new();
        for i in 0..500u32 {
            let line = format!("{}\n", i);
            all.extend_from_slice(line.as_bytes());
            buffer.push(line.as_bytes());
        }
        assert_eq!(&buffer.snapshot()[..], &all[all.len() - 100..]);
    }
}
