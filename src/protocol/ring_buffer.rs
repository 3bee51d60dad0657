use bytes::Bytes;
use std::{collections::VecDeque, ops::Range};

use crate::utils::escape_bytes;

/// Bounded FIFO byte queue shared between the transport's drain loop
/// (producer) and the notification parsers / reply readers (consumers).
///
/// The buffer never grows past its capacity and never blocks: once full, the
/// oldest byte is evicted to make room for the newest one. All searches run
/// over the logical byte order, so a pattern is either found contiguously or
/// not at all.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    evicted: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total number of bytes dropped on overflow since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Append one byte, evicting the oldest byte if the buffer is full.
    pub fn write(&mut self, byte: u8) {
        if self.buf.len() >= self.capacity {
            if let Some(old) = self.buf.pop_front() {
                self.evicted += 1;
                log::warn!(
                    "Ring buffer full ({} bytes), evicted oldest byte {}",
                    self.capacity,
                    escape_bytes(&[old])
                );
            }
        }
        self.buf.push_back(byte);
    }

    /// Append a run of bytes with the same overflow policy as [`write`](Self::write).
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            let dropped = overflow.min(self.buf.len());
            self.buf.drain(..dropped);
            self.evicted += dropped as u64;
            log::warn!(
                "Ring buffer full ({} bytes), evicted {} oldest bytes",
                self.capacity,
                overflow
            );
        }
        let skip = bytes.len().saturating_sub(self.capacity);
        if skip > 0 {
            self.evicted += skip as u64;
        }
        self.buf.extend(&bytes[skip..]);
    }

    /// Remove and return the front byte.
    pub fn read(&mut self) -> Option<u8> {
        self.buf.pop_front()
    }

    /// Look at the front byte without removing it.
    pub fn peek(&self) -> Option<u8> {
        self.buf.front().copied()
    }

    pub fn has_pattern(&self, pattern: &[u8]) -> bool {
        self.find(pattern, 0).is_some()
    }

    /// Remove the first occurrence of `pattern`, returning how many bytes were removed.
    pub fn remove_pattern(&mut self, pattern: &[u8]) -> usize {
        match self.find(pattern, 0) {
            Some(start) => {
                self.buf.drain(start..start + pattern.len());
                pattern.len()
            }
            None => 0,
        }
    }

    /// Extract the span from the first `begin` through the first `end` that
    /// follows it, both delimiters included. Returns an empty value and leaves
    /// the buffer untouched when either delimiter is missing.
    pub fn read_between_patterns(&mut self, begin: &[u8], end: &[u8]) -> Bytes {
        let Some(start) = self.find(begin, 0) else {
            return Bytes::new();
        };
        let Some(stop) = self.find(end, start + begin.len()) else {
            return Bytes::new();
        };
        self.take_range(start..stop + end.len())
    }

    /// Index of the first occurrence of `pattern` at or after `from`.
    pub fn find(&self, pattern: &[u8], from: usize) -> Option<usize> {
        if pattern.is_empty() || self.buf.len() < pattern.len() {
            return None;
        }
        (from..=self.buf.len() - pattern.len()).find(|&i| self.matches_at(i, pattern))
    }

    fn matches_at(&self, index: usize, pattern: &[u8]) -> bool {
        pattern
            .iter()
            .enumerate()
            .all(|(offset, byte)| self.buf[index + offset] == *byte)
    }

    fn is_line_start(&self, index: usize) -> bool {
        index == 0 || self.buf[index - 1] == b'\n'
    }

    /// Locate the first complete line starting with `prefix` and ending with
    /// `terminator`. The returned range covers prefix through terminator.
    pub fn find_line(&self, prefix: &[u8], terminator: &[u8]) -> Option<Range<usize>> {
        let mut from = 0;
        while let Some(start) = self.find(prefix, from) {
            if self.is_line_start(start) {
                return self
                    .find(terminator, start + prefix.len())
                    .map(|end| start..end + terminator.len());
            }
            from = start + 1;
        }
        None
    }

    /// Line-anchored variant of [`find`](Self::find): only matches that begin a line count.
    pub fn find_line_start(&self, prefix: &[u8], from: usize) -> Option<usize> {
        let mut from = from;
        while let Some(start) = self.find(prefix, from) {
            if self.is_line_start(start) {
                return Some(start);
            }
            from = start + 1;
        }
        None
    }

    /// Remove and return the first complete CRLF-terminated line starting with `prefix`.
    pub fn take_line(&mut self, prefix: &[u8]) -> Option<Bytes> {
        let range = self.find_line(prefix, b"\r\n")?;
        Some(self.take_range(range))
    }

    /// Remove and return the bytes in `range`, leaving everything else intact.
    pub fn take_range(&mut self, range: Range<usize>) -> Bytes {
        let end = range.end.min(self.buf.len());
        let start = range.start.min(end);
        Bytes::from(self.buf.drain(start..end).collect::<Vec<u8>>())
    }

    /// Remove and return everything from the front up to (excluding) `end`.
    pub fn take_through(&mut self, end: usize) -> Bytes {
        self.take_range(0..end)
    }

    /// Pop up to `out.len()` bytes from the front into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len());
        for (slot, byte) in out.iter_mut().zip(self.buf.drain(..n)) {
            *slot = byte;
        }
        n
    }

    /// Copy of the current contents, front first.
    pub fn snapshot(&self) -> Bytes {
        Bytes::from(self.buf.iter().copied().collect::<Vec<u8>>())
    }

    /// Copy of the bytes in `range`.
    pub fn slice(&self, range: Range<usize>) -> Vec<u8> {
        self.buf.range(range).copied().collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, data: &[u8]) -> RingBuffer {
        let mut rb = RingBuffer::new(capacity);
        rb.extend_from_slice(data);
        rb
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut rb = RingBuffer::new(8);
        for byte in 0u8..50 {
            rb.write(byte);
            assert!(rb.len() <= rb.capacity());
        }
        // the oldest 42 bytes were evicted, 42..50 remain in order
        assert_eq!(rb.snapshot().as_ref(), &[42, 43, 44, 45, 46, 47, 48, 49]);
        assert_eq!(rb.evicted(), 42);
    }

    #[test]
    fn test_bulk_overflow_keeps_newest() {
        let mut rb = filled(4, b"ab");
        rb.extend_from_slice(b"cdef");
        assert_eq!(rb.snapshot().as_ref(), b"cdef");
        rb.extend_from_slice(b"0123456789");
        assert_eq!(rb.snapshot().as_ref(), b"6789");
        assert!(rb.len() <= 4);
    }

    #[test]
    fn test_read_and_peek() {
        let mut rb = filled(4, b"xy");
        assert_eq!(rb.peek(), Some(b'x'));
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.read(), Some(b'x'));
        assert_eq!(rb.read(), Some(b'y'));
        assert_eq!(rb.read(), None);
        assert_eq!(rb.peek(), None);
    }

    #[test]
    fn test_remove_absent_pattern_is_noop() {
        let mut rb = filled(32, b"garbage\r\n");
        assert!(!rb.has_pattern(b"OK"));
        assert_eq!(rb.remove_pattern(b"OK"), 0);
        assert_eq!(rb.snapshot().as_ref(), b"garbage\r\n");
    }

    #[test]
    fn test_has_then_remove_is_consistent() {
        let mut rb = filled(32, b"garbage\r\nOK\r\n");
        assert!(rb.has_pattern(b"OK"));
        assert_eq!(rb.remove_pattern(b"OK"), 2);
        assert_eq!(rb.snapshot().as_ref(), b"garbage\r\n\r\n");
    }

    #[test]
    fn test_pattern_after_wraparound() {
        let mut rb = RingBuffer::new(6);
        rb.extend_from_slice(b"xxxxO");
        rb.read();
        rb.read();
        rb.extend_from_slice(b"K\r\n");
        assert!(rb.has_pattern(b"OK\r\n"));
    }

    #[test]
    fn test_read_between_patterns() {
        let mut rb = filled(64, b"noise+QMTSTAT: 0,1\r\ntail");
        let span = rb.read_between_patterns(b"+QMTSTAT: ", b"\r\n");
        assert_eq!(span.as_ref(), b"+QMTSTAT: 0,1\r\n");
        assert_eq!(rb.snapshot().as_ref(), b"noisetail");
    }

    #[test]
    fn test_read_between_missing_end_leaves_buffer() {
        let mut rb = filled(64, b"+QMTSTAT: 0,");
        assert!(rb.read_between_patterns(b"+QMTSTAT: ", b"\r\n").is_empty());
        assert_eq!(rb.len(), 12);
    }

    #[test]
    fn test_take_line_is_anchored() {
        let mut rb = filled(64, b"\r\nAPP RDY\r\n\r\nRDY\r\n");
        let line = rb.take_line(b"RDY").unwrap();
        assert_eq!(line.as_ref(), b"RDY\r\n");
        assert!(rb.has_pattern(b"APP RDY"));
    }

    #[test]
    fn test_read_into() {
        let mut rb = filled(16, b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(rb.read_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.snapshot().as_ref(), b"ef");
    }
}
