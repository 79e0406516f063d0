//! # Staging Ring Buffer
//!
//! This module provides the fixed-capacity byte ring that stages inbound data
//! between a transport backend and the link framer.
//!
//! ## Design Principles
//!
//! 1. **Static Allocation**: Storage is a `[u8; N]` array sized at compile time,
//!    so the buffer never touches the heap.
//!
//! 2. **Explicit Overflow Policy**: Chosen at construction. A full buffer either
//!    drops incoming bytes or overwrites the oldest ones. Overflow is reported
//!    through return values, never by panicking.
//!
//! 3. **Contiguous Views**: The framer needs a linear view of a whole frame.
//!    [`RingBuffer::data`] rotates the storage when the logical window wraps
//!    past the end of the array.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RingBuffer<N>                         │
//! ├──────────┬───────────────────────┬─────────────────────────┤
//! │   free   │   readable data       │          free           │
//! └──────────┴───────────────────────┴─────────────────────────┘
//!            ▲                       ▲
//!          head                 tail = (head + len) % N
//! ```
//!
//! Wrapped state, before and after `data(len)` compaction:
//!
//! ```text
//! ┌─────────┬───────────────┬──────────┐      ┌──────────────────────┬─────────┐
//! │ D E F   │     free      │  A B C   │  ──► │ A B C D E F          │  free   │
//! └─────────┴───────────────┴──────────┘      └──────────────────────┴─────────┘
//!           ▲               ▲                 ▲                      ▲
//!          tail            head              head                   tail
//! ```

use crate::traits::TransportError;

/// Default staging capacity used by the host library for inbound reader bytes
pub const RX_BUFFER_SIZE: usize = 4096;

/// Ring used to stage inbound reader bytes ahead of the framer
pub type StagingBuffer = RingBuffer<RX_BUFFER_SIZE>;

/// What happens when a byte is pushed into a full buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// Keep the stored bytes and discard the incoming ones
    DropNew,
    /// Evict the oldest stored bytes to make room
    ReplaceOldest,
}

/// Observational counters; never consulted by the buffer itself
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferStats {
    /// Number of push/insert calls that exceeded the free space
    pub overflows: u32,
    /// Largest length ever observed
    pub max_length: usize,
    /// Total bytes accepted by push/insert
    pub pushes: u64,
    /// Total bytes released by pop/remove
    pub pops: u64,
}

/// Errors specific to buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferError {
    /// Attempted to write more data than available space
    Overflow,
    /// Attempted to read more data than available
    Underflow,
    /// Requested size exceeds buffer capacity
    SizeExceedsCapacity,
}

impl From<BufferError> for TransportError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Overflow => TransportError::BufferOverflow,
            BufferError::Underflow => TransportError::BufferUnderflow,
            BufferError::SizeExceedsCapacity => TransportError::BufferOverflow,
        }
    }
}

impl embedded_io::Error for BufferError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            BufferError::Overflow => embedded_io::ErrorKind::OutOfMemory,
            BufferError::Underflow => embedded_io::ErrorKind::Other,
            BufferError::SizeExceedsCapacity => embedded_io::ErrorKind::InvalidInput,
        }
    }
}

/// Fixed-capacity byte ring with a selectable overflow policy
///
/// `N` must be non-zero. The whole capacity is usable: the buffer tracks its
/// length explicitly instead of sacrificing a slot to tell full from empty.
///
/// # Example
///
/// ```rust
/// use cardreader_shared::buffer::{OverflowPolicy, RingBuffer};
///
/// let mut ring: RingBuffer<8> = RingBuffer::new(OverflowPolicy::DropNew);
/// assert_eq!(ring.insert(b"hello"), 5);
///
/// let mut head = [0u8; 2];
/// assert_eq!(ring.peek(&mut head), 2);
/// assert_eq!(&head, b"he");
///
/// assert_eq!(ring.data(5), Some(&b"hello"[..]));
/// assert_eq!(ring.remove(5), 5);
/// assert!(ring.is_empty());
/// ```
pub struct RingBuffer<const N: usize> {
    data: [u8; N],
    head: usize,
    len: usize,
    policy: OverflowPolicy,
    stats: BufferStats,
}

impl<const N: usize> RingBuffer<N> {
    /// Create an empty buffer with the given overflow policy
    pub const fn new(policy: OverflowPolicy) -> Self {
        Self {
            data: [0u8; N],
            head: 0,
            len: 0,
            policy,
            stats: BufferStats {
                overflows: 0,
                max_length: 0,
                pushes: 0,
                pops: 0,
            },
        }
    }

    /// Total capacity in bytes
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes currently stored
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of bytes that can still be stored without overflowing
    #[inline]
    pub fn available(&self) -> usize {
        N - self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// The policy fixed at construction
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Usage counters
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    #[inline]
    fn tail(&self) -> usize {
        (self.head + self.len) % N
    }

    fn note_length(&mut self) {
        if self.len > self.stats.max_length {
            self.stats.max_length = self.len;
        }
    }

    /// Push a single byte
    ///
    /// Returns `true` if the buffer was full. Under [`OverflowPolicy::DropNew`]
    /// the byte is discarded; under [`OverflowPolicy::ReplaceOldest`] the oldest
    /// byte is evicted and `value` is stored.
    pub fn push(&mut self, value: u8) -> bool {
        let overflowed = self.is_full();
        if overflowed {
            self.stats.overflows += 1;
            match self.policy {
                OverflowPolicy::DropNew => return true,
                OverflowPolicy::ReplaceOldest => {
                    self.head = (self.head + 1) % N;
                    self.len -= 1;
                }
            }
        }

        let tail = self.tail();
        self.data[tail] = value;
        self.len += 1;
        self.stats.pushes += 1;
        self.note_length();
        overflowed
    }

    /// Pop the oldest byte, if any
    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let value = self.data[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        self.stats.pops += 1;
        Some(value)
    }

    /// Copy up to `dest.len()` of the oldest bytes without consuming them
    ///
    /// Returns the number of bytes copied, which is less than requested when
    /// the buffer holds fewer bytes.
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        let count = dest.len().min(self.len);
        if count == 0 {
            return 0;
        }

        let first_len = count.min(N - self.head);
        dest[..first_len].copy_from_slice(&self.data[self.head..self.head + first_len]);
        if first_len < count {
            dest[first_len..count].copy_from_slice(&self.data[..count - first_len]);
        }
        count
    }

    /// Append a slice
    ///
    /// Returns the number of bytes inserted. Under `DropNew` that is at most the
    /// free space; under `ReplaceOldest` every byte is accepted and only the
    /// newest `N` survive. Either way the overflow counter moves by at most one.
    pub fn insert(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let free = self.available();
        if src.len() > free {
            self.stats.overflows += 1;
        }

        let accepted = match self.policy {
            OverflowPolicy::DropNew => {
                let count = src.len().min(free);
                self.copy_in(&src[..count]);
                count
            }
            OverflowPolicy::ReplaceOldest => {
                let keep = if src.len() > N { &src[src.len() - N..] } else { src };
                let evict = keep.len().saturating_sub(self.available());
                self.head = (self.head + evict) % N;
                self.len -= evict;
                self.copy_in(keep);
                src.len()
            }
        };

        self.stats.pushes += accepted as u64;
        self.note_length();
        accepted
    }

    /// Copy bytes at the tail; caller guarantees they fit
    fn copy_in(&mut self, src: &[u8]) {
        let tail = self.tail();
        let first_len = src.len().min(N - tail);
        self.data[tail..tail + first_len].copy_from_slice(&src[..first_len]);
        if first_len < src.len() {
            self.data[..src.len() - first_len].copy_from_slice(&src[first_len..]);
        }
        self.len += src.len();
    }

    /// Discard up to `num_bytes` from the head; returns how many were removed
    pub fn remove(&mut self, num_bytes: usize) -> usize {
        let count = num_bytes.min(self.len);
        if count == 0 {
            return 0;
        }
        self.head = (self.head + count) % N;
        self.len -= count;
        self.stats.pops += count as u64;
        count
    }

    /// Drop all stored bytes
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Contiguous view of the next `num_bytes` bytes
    ///
    /// Returns `None` if fewer bytes are stored. When the requested window
    /// wraps past the end of storage the contents are rotated so the readable
    /// region starts at index zero; order, length and subsequent push/pop
    /// behavior are unchanged.
    pub fn data(&mut self, num_bytes: usize) -> Option<&[u8]> {
        if num_bytes > self.len {
            return None;
        }
        if num_bytes == 0 {
            return Some(&[]);
        }

        if self.head + num_bytes > N {
            self.data.rotate_left(self.head);
            self.head = 0;
        }
        Some(&self.data[self.head..self.head + num_bytes])
    }
}

impl<const N: usize> core::fmt::Debug for RingBuffer<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &N)
            .field("head", &self.head)
            .field("len", &self.len)
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<const N: usize> embedded_io::ErrorType for RingBuffer<N> {
    type Error = BufferError;
}

impl<const N: usize> embedded_io::Write for RingBuffer<N> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.insert(buf) {
            0 => Err(BufferError::Overflow),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The ring never reaches end of stream: reading while empty is `Underflow`,
/// not `Ok(0)`, so more bytes may still arrive later.
impl<const N: usize> embedded_io::Read for RingBuffer<N> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_empty() {
            return Err(BufferError::Underflow);
        }
        let count = self.peek(buf);
        self.remove(count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, Write};

    #[test]
    fn test_new_buffer_is_empty() {
        let ring: RingBuffer<16> = RingBuffer::new(OverflowPolicy::DropNew);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.available(), 16);
        assert_eq!(ring.stats(), BufferStats::default());
    }

    #[test]
    fn test_push_and_pop() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::DropNew);
        assert!(!ring.push(1));
        assert!(!ring.push(2));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_drop_new_policy_keeps_old_bytes() {
        let mut ring: RingBuffer<3> = RingBuffer::new(OverflowPolicy::DropNew);
        for b in [1, 2, 3] {
            assert!(!ring.push(b));
        }
        assert!(ring.push(4));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.stats().overflows, 1);

        let mut out = [0u8; 3];
        ring.peek(&mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_replace_policy_evicts_oldest() {
        let mut ring: RingBuffer<3> = RingBuffer::new(OverflowPolicy::ReplaceOldest);
        for b in [1, 2, 3] {
            ring.push(b);
        }
        assert!(ring.push(4));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.stats().overflows, 1);

        let mut out = [0u8; 3];
        ring.peek(&mut out);
        assert_eq!(out, [2, 3, 4]);
    }

    #[test]
    fn test_insert_truncates_under_drop_new() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::DropNew);
        assert_eq!(ring.insert(&[1, 2, 3]), 3);
        assert_eq!(ring.insert(&[4, 5, 6]), 1);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.stats().overflows, 1);
        assert_eq!(ring.insert(&[7]), 0);
        assert_eq!(ring.stats().overflows, 2);
    }

    #[test]
    fn test_insert_larger_than_capacity_under_replace() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::ReplaceOldest);
        ring.insert(&[9, 9]);
        assert_eq!(ring.insert(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.stats().overflows, 1);
        assert_eq!(ring.data(4), Some(&[3, 4, 5, 6][..]));
    }

    #[test]
    fn test_peek_reports_short_count() {
        let mut ring: RingBuffer<8> = RingBuffer::new(OverflowPolicy::DropNew);
        ring.insert(b"abc");
        let mut out = [0u8; 6];
        assert_eq!(ring.peek(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_data_rotates_wrapped_window() {
        let mut ring: RingBuffer<8> = RingBuffer::new(OverflowPolicy::DropNew);
        ring.insert(b"xxxxxx");
        ring.remove(6);
        // head is now at index 6; the next insert wraps
        ring.insert(b"ABCDEF");
        assert_eq!(ring.data(6), Some(&b"ABCDEF"[..]));

        // Buffer keeps working after compaction
        assert_eq!(ring.remove(2), 2);
        assert_eq!(ring.insert(b"GHij"), 4);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.data(8), Some(&b"CDEFGHij"[..]));
    }

    #[test]
    fn test_data_is_stable_against_peek() {
        let mut ring: RingBuffer<5> = RingBuffer::new(OverflowPolicy::DropNew);
        ring.insert(&[1, 2, 3]);
        ring.remove(3);
        ring.insert(&[4, 5, 6, 7]);

        let mut before = [0u8; 4];
        ring.peek(&mut before);
        let view = ring.data(4).map(|d| d.to_vec());
        let mut after = [0u8; 4];
        ring.peek(&mut after);

        assert_eq!(view.as_deref(), Some(&before[..]));
        assert_eq!(before, after);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_data_rejects_oversized_request() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::DropNew);
        ring.insert(&[1, 2]);
        assert_eq!(ring.data(3), None);
        assert_eq!(ring.data(0), Some(&[][..]));
    }

    #[test]
    fn test_length_tracks_net_bytes() {
        let mut ring: RingBuffer<10> = RingBuffer::new(OverflowPolicy::DropNew);
        let mut expected: usize = 0;
        let ops: [(usize, usize); 6] = [(4, 0), (3, 2), (6, 1), (0, 5), (9, 3), (2, 20)];
        for (ins, rem) in ops {
            let chunk = [0xAAu8; 16];
            let inserted = ring.insert(&chunk[..ins]);
            assert_eq!(inserted, ins.min(10 - expected));
            expected = (expected + ins).min(10);

            let removed = ring.remove(rem);
            assert_eq!(removed, rem.min(expected));
            expected = expected.saturating_sub(rem);
            assert_eq!(ring.len(), expected);
        }
    }

    #[test]
    fn test_stats_count_bytes() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::DropNew);
        ring.insert(&[1, 2, 3]);
        ring.pop();
        ring.remove(1);
        let stats = ring.stats();
        assert_eq!(stats.pushes, 3);
        assert_eq!(stats.pops, 2);
        assert_eq!(stats.max_length, 3);
        assert_eq!(stats.overflows, 0);
    }

    #[test]
    fn test_embedded_io_roundtrip() {
        let mut ring: RingBuffer<4> = RingBuffer::new(OverflowPolicy::DropNew);
        assert_eq!(ring.write(&[1, 2, 3, 4, 5]), Ok(4));
        assert_eq!(ring.write(&[6]), Err(BufferError::Overflow));

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), Ok(4));
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert!(ring.is_empty());

        // Empty is not end of stream
        assert_eq!(ring.read(&mut out), Err(BufferError::Underflow));
        assert_eq!(ring.read(&mut []), Ok(0));
        ring.write(&[7]).unwrap();
        assert_eq!(ring.read(&mut out), Ok(1));
        assert_eq!(out[0], 7);
    }
}
