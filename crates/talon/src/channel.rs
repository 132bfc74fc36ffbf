//! Pair of ring buffers plus the notification region: the framing-agnostic
//! half of a connection.
//!
//! Each direction's mapping is created once, by the server, and holds the
//! pair of atomic counters *written by one side*: the c2s mapping holds
//! `head_c2s` and `tail_s2c` (both written by the client); the s2c mapping
//! holds `head_s2c` and `tail_c2s` (both written by the server). A
//! [`RingBufferView`] straddles both mappings, which is why construction
//! collects pointers into a temporary record before either ring exists.

use crate::buffer::{DrainCursor, FillCursor};
use crate::error::{Error, ProtocolError, Result};
use crate::ring::{RingBufferView, Role};
use crate::shm::MappedRegion;
use crate::wire::{
    self, CommonHeader, FormatBClass, FormatBHeader, MessageFormat, COMMON_HEADER_SIZE,
    FORMAT_B_HEADER_SIZE, NOTIFICATION_REGION_SIZE, RING_COUNTER_PAIR_SIZE,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Which end of the channel this process is. Determines which half of each
/// counter pair and notification flag pair this side owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Created the three shared-memory objects; produces on the s2c ring.
    Server,
    /// Opened the three shared-memory objects by name; produces on the c2s ring.
    Client,
}

/// Required size, in bytes, of a direction mapping given its ring capacity.
pub const fn direction_mapping_size(ring_capacity: u32) -> usize {
    RING_COUNTER_PAIR_SIZE + ring_capacity as usize
}

/// A temporary record collecting the raw pointers needed to build both
/// [`RingBufferView`]s once the two direction mappings are both in hand.
/// Neither ring can be constructed from one mapping alone.
struct RingCreationData {
    head_c2s: *const AtomicU32,
    tail_s2c: *const AtomicU32,
    head_s2c: *const AtomicU32,
    tail_c2s: *const AtomicU32,
    c2s_data: *mut [u8],
    s2c_data: *mut [u8],
}

impl RingCreationData {
    unsafe fn collect(c2s: &mut MappedRegion, s2c: &mut MappedRegion) -> Self {
        let c2s_ptr = c2s.as_ptr();
        let s2c_ptr = s2c.as_ptr();
        Self {
            head_c2s: c2s_ptr as *const AtomicU32,
            tail_s2c: unsafe { (c2s_ptr as *const AtomicU32).add(1) },
            head_s2c: s2c_ptr as *const AtomicU32,
            tail_c2s: unsafe { (s2c_ptr as *const AtomicU32).add(1) },
            c2s_data: std::ptr::slice_from_raw_parts_mut(
                unsafe { c2s_ptr.add(RING_COUNTER_PAIR_SIZE) },
                c2s.len() - RING_COUNTER_PAIR_SIZE,
            ),
            s2c_data: std::ptr::slice_from_raw_parts_mut(
                unsafe { s2c_ptr.add(RING_COUNTER_PAIR_SIZE) },
                s2c.len() - RING_COUNTER_PAIR_SIZE,
            ),
        }
    }
}

/// Two SPSC ring buffers (send and receive) plus the four-flag notification
/// region. Owns three [`MappedRegion`]s and the cached ring/sequence/water-mark
/// state layered on top of them.
pub struct Channel {
    #[allow(dead_code)]
    c2s_region: MappedRegion,
    #[allow(dead_code)]
    s2c_region: MappedRegion,
    #[allow(dead_code)]
    notification_region: MappedRegion,

    send_ring: RingBufferView<'static>,
    receive_ring: RingBufferView<'static>,

    self_wants_readable: &'static AtomicBool,
    self_wants_writable: &'static AtomicBool,
    peer_wants_readable: &'static AtomicBool,
    peer_wants_writable: &'static AtomicBool,

    next_to_send: u16,
    next_to_receive: u16,

    /// Edge-triggered latch for the water-mark crossing rule: we only want
    /// to notify on the transition from below the mark to at-or-above it.
    below_water_mark: bool,
}

// Safety: every field is either an owned mapping or a reference into memory
// kept alive by one of those mappings, for the lifetime of this Channel.
unsafe impl Send for Channel {}

impl Channel {
    /// Build a Channel from the three mappings negotiated during the
    /// handshake. `c2s`/`s2c` must each be at least
    /// [`direction_mapping_size`] bytes for their negotiated capacity, and
    /// `notification` must be exactly [`NOTIFICATION_REGION_SIZE`] bytes.
    pub fn new(
        mut c2s: MappedRegion,
        mut s2c: MappedRegion,
        notification: MappedRegion,
        side: Side,
    ) -> Result<Self> {
        if notification.len() != NOTIFICATION_REGION_SIZE {
            return Err(Error::Api("notification region has the wrong size"));
        }
        if c2s.len() <= RING_COUNTER_PAIR_SIZE || s2c.len() <= RING_COUNTER_PAIR_SIZE {
            return Err(Error::Api("direction mapping smaller than its header"));
        }

        let creation = unsafe { RingCreationData::collect(&mut c2s, &mut s2c) };

        // Extend borrows to 'static: the backing mmap'd memory stays at a
        // fixed address for as long as `c2s_region`/`s2c_region` remain
        // mapped, which is the lifetime of this Channel (they drop with it).
        let head_c2s: &'static AtomicU32 = unsafe { &*creation.head_c2s };
        let tail_s2c: &'static AtomicU32 = unsafe { &*creation.tail_s2c };
        let head_s2c: &'static AtomicU32 = unsafe { &*creation.head_s2c };
        let tail_c2s: &'static AtomicU32 = unsafe { &*creation.tail_c2s };
        let c2s_data: &'static mut [u8] = unsafe { &mut *creation.c2s_data };
        let s2c_data: &'static mut [u8] = unsafe { &mut *creation.s2c_data };

        let (send_ring, receive_ring) = match side {
            Side::Client => (
                unsafe { RingBufferView::new(head_c2s, tail_c2s, Role::Producer, c2s_data) },
                unsafe { RingBufferView::new(tail_s2c, head_s2c, Role::Consumer, s2c_data) },
            ),
            Side::Server => (
                unsafe { RingBufferView::new(head_s2c, tail_s2c, Role::Producer, s2c_data) },
                unsafe { RingBufferView::new(tail_c2s, head_c2s, Role::Consumer, c2s_data) },
            ),
        };

        let notif_ptr = notification.as_ptr();
        let flag = |offset: usize| -> &'static AtomicBool {
            unsafe { &*(notif_ptr.add(offset) as *const AtomicBool) }
        };
        // Byte layout: [client-wants-readable, client-wants-writable,
        //               server-wants-readable, server-wants-writable]
        let (self_wants_readable, self_wants_writable, peer_wants_readable, peer_wants_writable) =
            match side {
                Side::Client => (flag(0), flag(1), flag(2), flag(3)),
                Side::Server => (flag(2), flag(3), flag(0), flag(1)),
            };
        // All four flags start "set" (no request outstanding). Only the side
        // that creates the objects needs to do this; the opening side would
        // otherwise race a concurrent request from an already-running peer.
        if side == Side::Server {
            for f in [
                self_wants_readable,
                self_wants_writable,
                peer_wants_readable,
                peer_wants_writable,
            ] {
                f.store(true, Ordering::SeqCst);
            }
        }

        Ok(Self {
            c2s_region: c2s,
            s2c_region: s2c,
            notification_region: notification,
            send_ring,
            receive_ring,
            self_wants_readable,
            self_wants_writable,
            peer_wants_readable,
            peer_wants_writable,
            next_to_send: 1,
            next_to_receive: 1,
            below_water_mark: false,
        })
    }

    pub fn send_capacity(&self) -> u32 {
        self.send_ring.capacity()
    }

    pub fn receive_capacity(&self) -> u32 {
        self.receive_ring.capacity()
    }

    pub fn send_free_space(&self) -> u32 {
        self.send_ring.free_space()
    }

    /// Refresh our view of how much room the peer has freed on the send ring.
    pub fn update_local_view_on_send(&mut self) -> Result<()> {
        self.send_ring.load_peer_index()
    }

    /// Refresh our view of how much the peer has produced on the receive ring.
    pub fn update_local_view_on_receive(&mut self) -> Result<()> {
        self.receive_ring.load_peer_index()
    }

    pub fn is_space_for_common_header_available(&self) -> bool {
        self.send_ring.free_space() as usize >= COMMON_HEADER_SIZE
    }

    pub fn is_common_header_available(&self) -> bool {
        self.receive_ring.used_space() as usize >= COMMON_HEADER_SIZE
    }

    pub fn is_format_b_header_available(&self) -> bool {
        self.receive_ring.used_space() as usize >= FORMAT_B_HEADER_SIZE
    }

    pub fn is_any_data_available(&self) -> bool {
        !self.receive_ring.is_empty()
    }

    /// `free_space < capacity / K`. Named to match the underlying contract
    /// exactly: "exceeded" means the receive side is low on room, not that
    /// a notification is due — that's the edge computed by
    /// [`Channel::receive_water_mark_crossed_upward`].
    pub fn is_receive_water_mark_exceeded(&self) -> bool {
        self.receive_ring.free_space() < self.receive_ring.capacity() / wire::WATER_MARK_DIVISOR
    }

    /// Call after any operation that shrinks the receive ring's used space.
    /// Returns `true` exactly once per crossing from below the water mark to
    /// at-or-above it — the edge a writable notification should be sent on.
    pub fn receive_water_mark_crossed_upward(&mut self) -> bool {
        let now_below = self.is_receive_water_mark_exceeded();
        let crossed = self.below_water_mark && !now_below;
        self.below_water_mark = now_below;
        if crossed {
            tracing::trace!(free = self.receive_ring.free_space(), "water mark crossed upward");
        }
        crossed
    }

    /// Peek at the next common header without consuming it.
    pub fn peek_common_header(&self) -> Option<CommonHeader> {
        if !self.is_common_header_available() {
            return None;
        }
        let mut buf = [0u8; COMMON_HEADER_SIZE];
        self.receive_ring.peek(&mut buf);
        CommonHeader::decode(&buf)
    }

    /// Bytes currently sitting in the receive ring, not yet consumed.
    pub fn receive_used_space(&self) -> u32 {
        self.receive_ring.used_space()
    }

    /// Peek the format-B header that would follow the not-yet-consumed
    /// common header, without consuming either.
    pub fn peek_format_b_header(&self) -> Option<FormatBHeader> {
        let mut buf = [0u8; FORMAT_B_HEADER_SIZE];
        if self.receive_ring.peek_at(COMMON_HEADER_SIZE, &mut buf) != FORMAT_B_HEADER_SIZE {
            return None;
        }
        FormatBHeader::decode(&buf)
    }

    /// Consume and validate the next common header, checking the sequence
    /// number against what we expect next.
    pub fn receive_common_header(&mut self) -> Result<CommonHeader> {
        let mut buf = [0u8; COMMON_HEADER_SIZE];
        let n = self.receive_ring.read(&mut buf);
        if n != COMMON_HEADER_SIZE {
            return Err(Error::Busy);
        }
        let header =
            CommonHeader::decode(&buf).ok_or(Error::Protocol(ProtocolError::MalformedCommonHeader))?;
        if header.sequence != self.next_to_receive {
            return Err(Error::Protocol(ProtocolError::SequenceMismatch));
        }
        self.next_to_receive = wire::next_sequence(self.next_to_receive);
        Ok(header)
    }

    /// Encode and write a common header with the next send sequence number.
    pub fn send_common_header(&mut self, format: MessageFormat, payload_len: u32) -> Result<()> {
        let header = CommonHeader {
            version: wire::PROTOCOL_VERSION,
            format,
            sequence: self.next_to_send,
            payload_len,
        };
        let encoded = header.encode();
        if self.send_ring.write(&encoded) != encoded.len() {
            return Err(Error::Busy);
        }
        self.next_to_send = wire::next_sequence(self.next_to_send);
        Ok(())
    }

    pub fn receive_format_b_header(&mut self) -> Result<FormatBHeader> {
        let mut buf = [0u8; FORMAT_B_HEADER_SIZE];
        if self.receive_ring.read(&mut buf) != FORMAT_B_HEADER_SIZE {
            return Err(Error::Busy);
        }
        FormatBHeader::decode(&buf).ok_or(Error::Protocol(ProtocolError::MalformedFormatBHeader))
    }

    pub fn send_format_b_header(&mut self, class: FormatBClass) -> Result<()> {
        let encoded = FormatBHeader { class }.encode();
        if self.send_ring.write(&encoded) != encoded.len() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Copy as much of the next payload bytes as are available into `cursor`.
    /// Returns the number of bytes copied.
    pub fn receive_part_of_data(&mut self, cursor: &mut FillCursor<'_, '_>) -> usize {
        let mut total = 0usize;
        let mut chunk = [0u8; 4096];
        loop {
            let want = chunk
                .len()
                .min(cursor.remaining())
                .min(self.receive_ring.used_space() as usize);
            if want == 0 {
                break;
            }
            let n = self.receive_ring.read(&mut chunk[..want]);
            total += cursor.fill(&chunk[..n]);
        }
        total
    }

    /// Best-effort write of as much of `cursor`'s remaining bytes as fit in
    /// the send ring's free space. Returns the number of bytes written.
    pub fn send_part_of_data(&mut self, cursor: &mut DrainCursor<'_, '_>) -> usize {
        let mut total = 0usize;
        let mut chunk = [0u8; 4096];
        loop {
            let want = chunk
                .len()
                .min(cursor.remaining())
                .min(self.send_ring.free_space() as usize);
            if want == 0 {
                break;
            }
            let n = cursor.drain(&mut chunk[..want]);
            total += self.send_ring.write(&chunk[..n]);
        }
        total
    }

    /// Discard `n` bytes of payload the caller has decided not to keep
    /// (truncation); returns the number actually discarded.
    pub fn discard_rest_of_data(&mut self, n: usize) -> usize {
        self.receive_ring.discard(n)
    }

    pub fn commit_send(&self) {
        self.send_ring.commit();
        tracing::trace!("send ring committed");
    }

    pub fn commit_receive(&self) {
        self.receive_ring.commit();
        tracing::trace!("receive ring committed");
    }

    /// Arm our own "wants a readable wakeup" flag.
    pub fn request_readable_notification(&self) {
        self.self_wants_readable.store(false, Ordering::SeqCst);
    }

    pub fn request_writable_notification(&self) {
        self.self_wants_writable.store(false, Ordering::SeqCst);
    }

    pub fn reset_readable_notification_request(&self) {
        self.self_wants_readable.store(true, Ordering::SeqCst);
    }

    pub fn reset_writable_notification_request(&self) {
        self.self_wants_writable.store(true, Ordering::SeqCst);
    }

    /// If the peer had an outstanding readable-wakeup request, reset it and
    /// return `true` so the caller knows to send the wakeup byte.
    pub fn test_and_reset_peer_readable_notification_request(&self) -> bool {
        !self.peer_wants_readable.swap(true, Ordering::SeqCst)
    }

    pub fn test_and_reset_peer_writable_notification_request(&self) -> bool {
        !self.peer_wants_writable.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::MappedRegion;

    fn make_pair(capacity: u32) -> (MappedRegion, MappedRegion, MappedRegion, MappedRegion, MappedRegion, MappedRegion) {
        let c2s_server = MappedRegion::create("test-c2s", direction_mapping_size(capacity)).unwrap();
        let c2s_client = MappedRegion::open(c2s_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let s2c_server = MappedRegion::create("test-s2c", direction_mapping_size(capacity)).unwrap();
        let s2c_client = MappedRegion::open(s2c_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let notif_server = MappedRegion::create("test-notif", NOTIFICATION_REGION_SIZE).unwrap();
        let notif_client = MappedRegion::open(notif_server.id().clone(), NOTIFICATION_REGION_SIZE).unwrap();
        (c2s_server, c2s_client, s2c_server, s2c_client, notif_server, notif_client)
    }

    #[test]
    fn client_send_is_visible_to_server_receive() {
        let (c2s_server, c2s_client, s2c_server, s2c_client, notif_server, notif_client) =
            make_pair(256);

        let mut client = Channel::new(c2s_client, s2c_client, notif_client, Side::Client).unwrap();
        let mut server = Channel::new(c2s_server, s2c_server, notif_server, Side::Server).unwrap();

        client.send_common_header(MessageFormat::A, 5).unwrap();
        let send_bufs = [std::io::IoSlice::new(b"hello")];
        let mut cursor = DrainCursor::new(&send_bufs);
        client.send_part_of_data(&mut cursor);
        client.commit_send();

        server.update_local_view_on_receive().unwrap();
        assert!(server.is_common_header_available());
        let header = server.receive_common_header().unwrap();
        assert_eq!(header.sequence, 1);
        assert_eq!(header.payload_len, 5);

        let mut buf = [0u8; 5];
        let mut recv_bufs = [std::io::IoSliceMut::new(&mut buf)];
        let mut fill = FillCursor::new(&mut recv_bufs);
        let n = server.receive_part_of_data(&mut fill);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        server.commit_receive();
    }

    #[test]
    fn notification_flags_round_trip() {
        let (c2s_server, c2s_client, s2c_server, s2c_client, notif_server, notif_client) =
            make_pair(64);
        let client = Channel::new(c2s_client, s2c_client, notif_client, Side::Client).unwrap();
        let server = Channel::new(c2s_server, s2c_server, notif_server, Side::Server).unwrap();

        client.request_readable_notification();
        assert!(server.test_and_reset_peer_readable_notification_request());
        // Already reset: second observation sees nothing outstanding.
        assert!(!server.test_and_reset_peer_readable_notification_request());
    }
}
