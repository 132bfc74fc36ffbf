//! Lock-free single-producer/single-consumer byte ring.
//!
//! A `RingBufferView` doesn't own any memory — it borrows pointers to the
//! two atomic counters (which may live in different mapped regions, see
//! [`crate::channel`]) and a data span for the duration of the channel.
//! Reads/writes work on *cached* counters; [`RingBufferView::load_peer_index`]
//! and [`RingBufferView::commit_head`]/[`RingBufferView::commit_tail`] are the
//! only two points where the shared counters are actually touched.

use crate::error::{Error, ProtocolError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// A ring buffer view over a borrowed data span.
///
/// `own` is the counter this side mutates (`head` if this side is the
/// producer, `tail` if it is the consumer); `peer` is the counter the other
/// side mutates. Both pointers are valid for `'a`, which in practice is the
/// lifetime of the owning [`crate::channel::Channel`]'s mapped regions.
pub struct RingBufferView<'a> {
    own: &'a AtomicU32,
    peer: &'a AtomicU32,
    data: &'a mut [u8],
    capacity: u32,
    role: Role,
    own_cached: u32,
    peer_cached: u32,
}

/// Which counter this view's `own` field represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `own` is head; `peer` is tail.
    Producer,
    /// `own` is tail; `peer` is head.
    Consumer,
}

impl<'a> RingBufferView<'a> {
    /// # Safety
    /// `own` and `peer` must each point to a live `AtomicU32` for as long as
    /// this view exists, and `data` must be exactly `capacity` bytes.
    pub unsafe fn new(own: &'a AtomicU32, peer: &'a AtomicU32, role: Role, data: &'a mut [u8]) -> Self {
        let capacity = data.len() as u32;
        Self {
            own,
            peer,
            data,
            capacity,
            role,
            own_cached: own.load(Ordering::Relaxed),
            peer_cached: peer.load(Ordering::Relaxed),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn used(&self, own: u32, peer: u32) -> u32 {
        match self.role {
            Role::Producer => own.wrapping_sub(peer), // head - tail
            Role::Consumer => peer.wrapping_sub(own), // head - tail
        }
    }

    /// Acquire-load the peer's counter and validate it. This is the sole
    /// point at which forward progress made by the peer becomes visible.
    pub fn load_peer_index(&mut self) -> Result<()> {
        let fresh = self.peer.load(Ordering::Acquire);
        if self.used(self.own_cached, fresh) > self.capacity {
            return Err(Error::Protocol(ProtocolError::InvalidRingIndex));
        }
        self.peer_cached = fresh;
        Ok(())
    }

    pub fn used_space(&self) -> u32 {
        self.used(self.own_cached, self.peer_cached)
    }

    pub fn free_space(&self) -> u32 {
        self.capacity - self.used_space()
    }

    pub fn is_empty(&self) -> bool {
        self.used_space() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Copy up to `dst.len()` bytes out of the ring (consumer side),
    /// advancing the cached tail. Does not publish the new tail.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        debug_assert_eq!(self.role, Role::Consumer);
        let n = dst.len().min(self.used_space() as usize);
        self.copy_out(self.own_cached, &mut dst[..n]);
        self.own_cached = self.own_cached.wrapping_add(n as u32);
        n
    }

    /// Copy up to `dst.len()` bytes out of the ring without consuming them.
    /// Used to peek at a header before committing to reading the rest of a
    /// message.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        debug_assert_eq!(self.role, Role::Consumer);
        let n = dst.len().min(self.used_space() as usize);
        self.copy_out(self.own_cached, &mut dst[..n]);
        n
    }

    /// Like [`RingBufferView::peek`], but starting `skip` bytes past the
    /// current read position instead of at it. Used to look past a header
    /// that hasn't been consumed yet without disturbing it.
    pub fn peek_at(&self, skip: usize, dst: &mut [u8]) -> usize {
        debug_assert_eq!(self.role, Role::Consumer);
        let available = (self.used_space() as usize).saturating_sub(skip);
        let n = dst.len().min(available);
        self.copy_out(self.own_cached.wrapping_add(skip as u32), &mut dst[..n]);
        n
    }

    /// Skip up to `n` bytes without copying them out (used for truncation).
    pub fn discard(&mut self, n: usize) -> usize {
        debug_assert_eq!(self.role, Role::Consumer);
        let n = n.min(self.used_space() as usize);
        self.own_cached = self.own_cached.wrapping_add(n as u32);
        n
    }

    /// Copy up to `src.len()` bytes into the ring (producer side),
    /// advancing the cached head. Does not publish the new head.
    pub fn write(&mut self, src: &[u8]) -> usize {
        debug_assert_eq!(self.role, Role::Producer);
        let n = src.len().min(self.free_space() as usize);
        self.copy_in(self.own_cached, &src[..n]);
        self.own_cached = self.own_cached.wrapping_add(n as u32);
        n
    }

    /// Release-store the owned counter, publishing progress to the peer.
    pub fn commit(&self) {
        self.own.store(self.own_cached, Ordering::Release);
    }

    /// Re-synchronize the local cache of our own counter (used after a
    /// reset, never needed in the steady-state happy path).
    pub fn resync_own(&mut self) {
        self.own_cached = self.own.load(Ordering::Relaxed);
    }

    fn index(&self, counter: u32) -> usize {
        (counter % self.capacity) as usize
    }

    fn copy_out(&self, from: u32, dst: &mut [u8]) {
        let start = self.index(from);
        let first = (self.capacity as usize - start).min(dst.len());
        dst[..first].copy_from_slice(&self.data[start..start + first]);
        let dst_len = dst.len();
        if first < dst_len {
            dst[first..].copy_from_slice(&self.data[..dst_len - first]);
        }
    }

    fn copy_in(&mut self, at: u32, src: &[u8]) {
        let start = self.index(at);
        let first = (self.capacity as usize - start).min(src.len());
        self.data[start..start + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            self.data[..src.len() - first].copy_from_slice(&src[first..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_pair(capacity: usize) -> (AtomicU32, AtomicU32, Vec<u8>) {
        (AtomicU32::new(0), AtomicU32::new(0), vec![0u8; capacity])
    }

    #[test]
    fn producer_consumer_roundtrip() {
        let (head, tail, mut data) = ring_pair(8);
        let mut producer = unsafe { RingBufferView::new(&head, &tail, Role::Producer, &mut data) };
        let written = producer.write(b"hello");
        assert_eq!(written, 5);
        producer.commit();
        drop(producer);

        let mut data2 = data.clone();
        let mut consumer = unsafe { RingBufferView::new(&tail, &head, Role::Consumer, &mut data2) };
        consumer.load_peer_index().unwrap();
        assert_eq!(consumer.used_space(), 5);
        let mut buf = [0u8; 5];
        let n = consumer.read(&mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        consumer.commit();
    }

    #[test]
    fn wrap_around_read_write() {
        let (head, tail, mut data) = ring_pair(4);
        let mut producer = unsafe { RingBufferView::new(&head, &tail, Role::Producer, &mut data) };
        assert_eq!(producer.write(b"ab"), 2);
        producer.commit();
        // Simulate the consumer having drained 2 bytes already.
        tail.store(2, Ordering::Release);
        producer.load_peer_index().unwrap();
        // 3 bytes starting at index 2 of a 4-byte ring wraps past the end.
        assert_eq!(producer.write(b"cde"), 3);
        producer.commit();

        let mut data2 = data.clone();
        let mut consumer = unsafe { RingBufferView::new(&tail, &head, Role::Consumer, &mut data2) };
        consumer.load_peer_index().unwrap();
        assert_eq!(consumer.used_space(), 3);
        let mut buf = [0u8; 3];
        consumer.read(&mut buf);
        assert_eq!(&buf, b"cde");
    }

    #[test]
    fn invalid_peer_index_is_protocol_error() {
        let (head, tail, mut data) = ring_pair(4);
        // Peer claims to have produced more than capacity allows.
        head.store(10, Ordering::Release);
        let mut consumer = unsafe { RingBufferView::new(&tail, &head, Role::Consumer, &mut data) };
        let err = consumer.load_peer_index().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidRingIndex)));
    }

    #[test]
    fn full_ring_rejects_writes() {
        let (head, tail, mut data) = ring_pair(4);
        let mut producer = unsafe { RingBufferView::new(&head, &tail, Role::Producer, &mut data) };
        assert_eq!(producer.write(b"abcd"), 4);
        producer.commit();
        assert!(producer.is_full());
        assert_eq!(producer.write(b"e"), 0);
    }
}
