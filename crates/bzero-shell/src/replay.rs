//! Bounded replay of recent PTY output.

use std::collections::VecDeque;

/// Ring buffer of the most recent output bytes, replayed on attach.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    buf: VecDeque<u8>,
}

impl ReplayBuffer {
    /// Default replay window.
    pub const DEFAULT_CAPACITY: usize = 64 * 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        while self.buf.len() + bytes.len() > self.capacity {
            self.buf.pop_front();
        }
        self.buf.extend(bytes);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_bytes() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.push(b"abcdef");
        buffer.push(b"ghij");
        assert_eq!(buffer.snapshot(), b"cdefghij");
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let mut buffer = ReplayBuffer::new(4);
        buffer.push(b"0123456789");
        assert_eq!(buffer.snapshot(), b"6789");
    }

    #[test]
    fn test_empty() {
        let buffer = ReplayBuffer::new(4);
        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());
    }
}
