//! Scatter/gather cursors over caller-provided buffer lists.
//!
//! Every copy path in [`crate::message`] goes through one of these so that
//! ring wrap and buffer-list wrap compose without special-casing either one.

use std::io::{IoSlice, IoSliceMut};

/// Walks a list of mutable buffers, filling them in order.
///
/// Used on the receive path: bytes pulled out of the ring are copied into
/// whatever the caller's buffer-provider callback handed back.
pub struct FillCursor<'a, 'b> {
    buffers: &'a mut [IoSliceMut<'b>],
    index: usize,
    offset: usize,
}

impl<'a, 'b> FillCursor<'a, 'b> {
    pub fn new(buffers: &'a mut [IoSliceMut<'b>]) -> Self {
        Self {
            buffers,
            index: 0,
            offset: 0,
        }
    }

    /// Bytes of buffer space not yet written to.
    pub fn remaining(&self) -> usize {
        let mut total = 0usize;
        if self.index < self.buffers.len() {
            total += self.buffers[self.index].len() - self.offset;
            for buf in &self.buffers[self.index + 1..] {
                total += buf.len();
            }
        }
        total
    }

    /// Total capacity across every buffer in the list, before any calls to
    /// [`FillCursor::fill`] — used to size a request before it's made.
    pub fn total_remaining(buffers: &[IoSliceMut<'_>]) -> usize {
        buffers.iter().map(|b| b.len()).sum()
    }

    /// Copy as much of `src` as fits into the remaining buffer space.
    /// Returns the number of bytes actually copied.
    pub fn fill(&mut self, mut src: &[u8]) -> usize {
        let mut copied = 0usize;
        while !src.is_empty() && self.index < self.buffers.len() {
            let buf = &mut self.buffers[self.index];
            let space = buf.len() - self.offset;
            if space == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = space.min(src.len());
            buf[self.offset..self.offset + n].copy_from_slice(&src[..n]);
            self.offset += n;
            src = &src[n..];
            copied += n;
            if self.offset == buf.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        copied
    }
}

/// Walks a list of immutable buffers, draining them in order.
///
/// Used on the send path: payload buffers the caller handed to
/// `MessageWriter` are copied into the ring.
pub struct DrainCursor<'a, 'b> {
    buffers: &'a [IoSlice<'b>],
    index: usize,
    offset: usize,
}

impl<'a, 'b> DrainCursor<'a, 'b> {
    pub fn new(buffers: &'a [IoSlice<'b>]) -> Self {
        Self {
            buffers,
            index: 0,
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        let mut total = 0usize;
        if self.index < self.buffers.len() {
            total += self.buffers[self.index].len() - self.offset;
            for buf in &self.buffers[self.index + 1..] {
                total += buf.len();
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Copy up to `dst.len()` bytes out of the buffer list into `dst`.
    /// Returns the number of bytes actually copied.
    pub fn drain(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0usize;
        while written < dst.len() && self.index < self.buffers.len() {
            let buf = &self.buffers[self.index];
            let available = buf.len() - self.offset;
            if available == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = available.min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&buf[self.offset..self.offset + n]);
            self.offset += n;
            written += n;
            if self.offset == buf.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        written
    }

    pub fn total_len(buffers: &[IoSlice<'_>]) -> usize {
        buffers.iter().map(|b| b.len()).sum()
    }
}
