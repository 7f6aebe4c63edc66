//! Per-descriptor read buffer with delimiter extraction.
//!
//! Hides the boundary between socket reads and message frames: the owner
//! reads whatever the descriptor has, then pulls out zero or more
//! complete frames. Bytes between `offset` and `filled` are the unread
//! region; they survive compaction and growth.

use std::os::unix::io::RawFd;

use crate::error::{Result, WorkError};

/// Growable read cache over one descriptor's byte stream.
///
/// Invariant: `0 <= offset <= filled <= buf.len()`.
#[derive(Debug)]
pub struct IoCache {
    buf: Vec<u8>,
    offset: usize,
    filled: usize,
}

impl IoCache {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0; size.max(1)],
            offset: 0,
            filled: 0,
        }
    }

    /// Bytes read but not yet consumed.
    pub fn available(&self) -> usize {
        self.filled - self.offset
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Add `add` bytes of room at the tail.
    pub fn grow(&mut self, add: usize) {
        self.buf.resize(self.buf.len() + add, 0);
    }

    /// Read available bytes from `fd` into the cache.
    ///
    /// When the unread region is empty the cache rewinds to the front;
    /// otherwise the unread bytes are compacted there to maximize the
    /// room for this read. A full cache doubles first so a read can
    /// never be asked for zero bytes. Returns `Ok(0)` on EOF.
    pub fn read(&mut self, fd: RawFd) -> Result<usize> {
        if self.offset >= self.filled {
            self.offset = 0;
            self.filled = 0;
        } else if self.offset > 0 {
            self.buf.copy_within(self.offset..self.filled, 0);
            self.filled -= self.offset;
            self.offset = 0;
        }

        if self.filled == self.buf.len() {
            self.grow(self.buf.len());
        }

        let room = self.buf.len() - self.filled;
        let n = unsafe {
            libc::read(
                fd,
                self.buf[self.filled..].as_mut_ptr() as *mut libc::c_void,
                room,
            )
        };
        if n < 0 {
            return Err(WorkError::last_sys());
        }
        self.filled += n as usize;
        Ok(n as usize)
    }

    /// Consume exactly `size` unread bytes and return them.
    ///
    /// Fails (returns `None`) when fewer than `size` bytes are unread.
    pub fn use_size(&mut self, size: usize) -> Option<&[u8]> {
        if self.available() < size {
            return None;
        }
        let start = self.offset;
        self.offset += size;
        Some(&self.buf[start..start + size])
    }

    /// Consume through the end of the next occurrence of `delim`.
    ///
    /// Returns the consumed region including the delimiter, or `None`
    /// when no complete delimiter is present (the unread prefix stays
    /// cached for the next read). Never scans past the unread region,
    /// so a delimiter straddling its end is simply not found yet.
    pub fn use_delim(&mut self, delim: &[u8]) -> Option<&[u8]> {
        if delim.is_empty() || self.available() < delim.len() {
            return None;
        }
        let region = &self.buf[self.offset..self.filled];
        let pos = region.windows(delim.len()).position(|w| w == delim)?;
        self.use_size(pos + delim.len())
    }
}
