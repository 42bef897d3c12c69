//! Growable read buffer.
//!
//! Reads frames whose total length is only discovered while reading.
//! The caller writes into [`GrowableBuffer::spare_mut`] and reports how many
//! bytes landed there with [`GrowableBuffer::advance`]. A write that fills the
//! spare window without being final doubles the capacity (clamped to the hard
//! limit). A final write freezes the logical view at the bytes written so far.
//!
//! ```
//! use woof_websocket::GrowableBuffer;
//!
//! let mut buffer = GrowableBuffer::new(2, Some(8));
//! buffer.spare_mut()[..2].copy_from_slice(b"ab");
//! buffer.advance(2, false)?; // full, grows to 4
//! buffer.spare_mut()[..1].copy_from_slice(b"c");
//! buffer.advance(1, true)?;
//! assert_eq!(buffer.as_slice(), b"abc");
//! # Ok::<(), woof_websocket::Error>(())
//! ```

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default initial capacity.
pub const DEFAULT_INITIAL_CAPACITY: usize = 8192;

// ============================================================================
// GrowableBuffer
// ============================================================================

/// Resizable byte buffer for reads of unknown length.
#[derive(Debug, Clone)]
pub struct GrowableBuffer {
    /// Backing storage, `data.len()` is the capacity.
    data: Vec<u8>,
    /// Bytes written in the current fill cycle.
    written: usize,
    /// Set by a final `advance`; the next write starts a new cycle.
    finished: bool,
    /// Hard capacity limit.
    limit: Option<usize>,
}

impl Default for GrowableBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, None)
    }
}

impl GrowableBuffer {
    /// Creates an empty buffer.
    ///
    /// The initial capacity is at least one byte and never above `limit`.
    #[must_use]
    pub fn new(initial: usize, limit: Option<usize>) -> Self {
        let mut capacity = initial.max(1);
        if let Some(limit) = limit {
            capacity = capacity.min(limit.max(1));
        }
        Self {
            data: vec![0; capacity],
            written: 0,
            finished: false,
            limit,
        }
    }

    /// Current capacity of the backing storage.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Logical length: bytes written in the current cycle.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.written
    }

    /// Returns `true` if no bytes were written in the current cycle.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Returns `true` once a final write has been recorded.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Written bytes, starting at offset 0.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.written]
    }

    /// Window the next read should write into.
    ///
    /// On a finished buffer this starts a new fill cycle.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.restart_if_finished();
        &mut self.data[self.written..]
    }

    /// Records `written` bytes in the spare window.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferOverflow`] if `written` exceeds the spare window, or
    ///   the window was filled by a non-final write and the limit forbids
    ///   growing.
    pub fn advance(&mut self, written: usize, is_final: bool) -> Result<()> {
        self.restart_if_finished();

        let spare = self.data.len() - self.written;
        if written > spare {
            return Err(Error::BufferOverflow {
                capacity: self.data.len(),
                limit: self.limit,
            });
        }

        self.written += written;

        if is_final {
            self.finished = true;
            return Ok(());
        }

        if self.written == self.data.len() {
            self.grow()?;
        }

        Ok(())
    }

    /// Empties the buffer, keeping its allocation.
    #[inline]
    pub fn reset(&mut self) {
        self.written = 0;
        self.finished = false;
    }

    /// Consumes the buffer, returning the written bytes.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.written);
        self.data
    }

    fn restart_if_finished(&mut self) {
        if self.finished {
            self.reset();
        }
    }

    /// Doubles the capacity, clamped to the limit.
    fn grow(&mut self) -> Result<()> {
        let capacity = self.data.len();
        let mut grown = capacity.saturating_mul(2);
        if let Some(limit) = self.limit {
            grown = grown.min(limit);
        }
        if grown <= capacity {
            return Err(Error::BufferOverflow {
                capacity,
                limit: self.limit,
            });
        }
        // resize keeps existing bytes at the same offsets
        self.data.resize(grown, 0);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    /// Writes `chunk` into the spare window and advances.
    fn feed(buffer: &mut GrowableBuffer, chunk: &[u8], is_final: bool) -> Result<()> {
        buffer.spare_mut()[..chunk.len()].copy_from_slice(chunk);
        buffer.advance(chunk.len(), is_final)
    }

    #[test]
    fn test_grows_when_full() {
        let mut buffer = GrowableBuffer::new(4, None);
        feed(&mut buffer, b"abcd", false).unwrap();
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.as_slice(), b"abcd");
    }

    #[test]
    fn test_partial_write_does_not_grow() {
        let mut buffer = GrowableBuffer::new(4, None);
        feed(&mut buffer, b"ab", false).unwrap();
        assert_eq!(buffer.capacity(), 4);
        feed(&mut buffer, b"c", true).unwrap();
        assert_eq!(buffer.as_slice(), b"abc");
        assert!(buffer.is_finished());
    }

    #[test]
    fn test_final_exact_fill_does_not_grow() {
        let mut buffer = GrowableBuffer::new(4, None);
        feed(&mut buffer, b"abcd", true).unwrap();
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_grow_clamped_to_limit() {
        let mut buffer = GrowableBuffer::new(4, Some(6));
        feed(&mut buffer, b"abcd", false).unwrap();
        assert_eq!(buffer.capacity(), 6);
        feed(&mut buffer, b"ef", true).unwrap();
        assert_eq!(buffer.as_slice(), b"abcdef");
    }

    #[test]
    fn test_overflow_at_limit() {
        let mut buffer = GrowableBuffer::new(4, Some(4));
        let err = feed(&mut buffer, b"abcd", false).unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { capacity: 4, .. }));
    }

    #[test]
    fn test_write_past_window_rejected() {
        let mut buffer = GrowableBuffer::new(2, None);
        assert!(buffer.advance(3, true).is_err());
    }

    #[test]
    fn test_zero_final_resets_without_realloc() {
        let mut buffer = GrowableBuffer::new(2, None);
        feed(&mut buffer, b"ab", false).unwrap();
        feed(&mut buffer, b"c", true).unwrap();
        let capacity = buffer.capacity();

        buffer.advance(0, true).unwrap();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn test_initial_capacity_clamped() {
        let buffer = GrowableBuffer::new(100, Some(10));
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(GrowableBuffer::new(0, None).capacity(), 1);
    }

    #[test]
    fn test_into_vec() {
        let mut buffer = GrowableBuffer::new(8, None);
        feed(&mut buffer, b"xyz", true).unwrap();
        assert_eq!(buffer.into_vec(), b"xyz".to_vec());
    }

    proptest! {
        /// Sequential fills from capacity 1 stay within the limit and keep
        /// earlier bytes at stable offsets.
        #[test]
        fn prop_growth_preserves_bytes(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            limit in 1usize..1024,
        ) {
            let mut buffer = GrowableBuffer::new(1, Some(limit));
            let mut offset = 0;
            let mut overflowed = false;

            while offset < data.len() {
                let spare = buffer.spare_mut().len();
                let take = spare.min(data.len() - offset);
                let is_final = offset + take == data.len();
                buffer.spare_mut()[..take].copy_from_slice(&data[offset..offset + take]);
                offset += take;

                if buffer.advance(take, is_final).is_err() {
                    overflowed = true;
                    break;
                }

                prop_assert!(buffer.capacity() <= limit.max(1));
                prop_assert_eq!(buffer.as_slice(), &data[..offset]);
            }

            if overflowed {
                prop_assert!(data.len() >= limit);
            } else if !data.is_empty() {
                prop_assert_eq!(buffer.as_slice(), &data[..]);
            }
        }
    }
}
