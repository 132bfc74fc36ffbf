//! Stateful message decoder.
//!
//! One `MessageReader` lives for the whole life of a receive-side channel,
//! not one per message: [`MessageReader::receive_whole_message`] and the
//! chunked pair [`MessageReader::begin`]/[`MessageReader::read_chunk`] each
//! drive the state machine through exactly one message and reset it back to
//! `ReadingCommon` when done.

use crate::buffer::FillCursor;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::wire::{FormatBClass, MessageFormat, COMMON_HEADER_SIZE, FORMAT_B_HEADER_SIZE};
use std::io::IoSliceMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    ReadingCommon,
    ReadingPayload { remaining: usize },
}

/// The result of decoding a message's header(s), before its payload is read.
#[derive(Debug, Clone, Copy)]
pub struct PendingMessage {
    pub payload_len: usize,
    pub handle_attached: bool,
}

/// Result of a whole-message receive.
#[derive(Debug)]
pub struct WholeReceiveOutcome {
    pub bytes: usize,
    /// The payload length carried by the message's header, independent of
    /// how many bytes actually made it into the caller's buffers.
    pub payload_len: usize,
    pub truncated: bool,
    pub handle_attached: bool,
    pub notify_writable: bool,
}

/// Result of one chunked-receive step.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub bytes: usize,
    pub finished: bool,
    pub truncated: bool,
    pub notify_writable: bool,
}

/// Decoder state machine for one message at a time.
pub struct MessageReader {
    state: ReaderState,
    handle_attached: bool,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            state: ReaderState::ReadingCommon,
            handle_attached: false,
        }
    }

    fn reset(&mut self) {
        self.state = ReaderState::ReadingCommon;
        self.handle_attached = false;
    }

    /// Datagram-style receive: returns `Err(Busy)` unless the whole message
    /// (every header plus the full payload) is already in the ring. Never
    /// partially consumes on `Busy`.
    pub fn receive_whole_message(
        &mut self,
        channel: &mut Channel,
        buffers: &mut [IoSliceMut<'_>],
    ) -> Result<WholeReceiveOutcome> {
        debug_assert_eq!(self.state, ReaderState::ReadingCommon);

        let header = channel.peek_common_header().ok_or(Error::Busy)?;
        let payload_len = header.payload_len as usize;
        let format_b_len = match header.format {
            MessageFormat::A => 0,
            MessageFormat::B => FORMAT_B_HEADER_SIZE,
        };
        let total = COMMON_HEADER_SIZE + format_b_len + payload_len;

        if payload_len as u32 > channel.receive_capacity() {
            return Err(Error::Size);
        }
        if (channel.receive_used_space() as usize) < total {
            return Err(Error::Busy);
        }

        channel.receive_common_header()?;
        let handle_attached = if header.format == MessageFormat::B {
            let format_b = channel.receive_format_b_header()?;
            format_b.class == FormatBClass::HandleAttached
        } else {
            false
        };

        let requested = FillCursor::total_remaining(buffers);
        let mut cursor = FillCursor::new(buffers);
        let copied = channel.receive_part_of_data(&mut cursor);
        let truncated = requested < payload_len;
        if truncated {
            let leftover = payload_len - copied;
            tracing::warn!(payload_len, requested, "receive buffer too small, truncating");
            channel.discard_rest_of_data(leftover);
        }
        channel.commit_receive();
        let crossed = channel.receive_water_mark_crossed_upward();
        let notify_writable = crossed && channel.test_and_reset_peer_writable_notification_request();

        Ok(WholeReceiveOutcome {
            bytes: copied,
            payload_len,
            truncated,
            handle_attached,
            notify_writable,
        })
    }

    /// Decode just the headers of the next message, entering chunked mode.
    /// Returns `None` if the common header (or, for format B, the format-B
    /// header) hasn't fully arrived yet.
    pub fn begin(&mut self, channel: &mut Channel) -> Result<Option<PendingMessage>> {
        debug_assert_eq!(self.state, ReaderState::ReadingCommon);
        if !channel.is_common_header_available() {
            return Ok(None);
        }
        let peeked = channel.peek_common_header().expect("checked available");
        let needs_format_b = peeked.format == MessageFormat::B;
        if needs_format_b
            && (channel.receive_used_space() as usize)
                < COMMON_HEADER_SIZE + FORMAT_B_HEADER_SIZE
        {
            return Ok(None);
        }

        let header = channel.receive_common_header()?;
        self.handle_attached = if needs_format_b {
            let format_b = channel.receive_format_b_header()?;
            format_b.class == FormatBClass::HandleAttached
        } else {
            false
        };
        self.state = ReaderState::ReadingPayload {
            remaining: header.payload_len as usize,
        };
        Ok(Some(PendingMessage {
            payload_len: header.payload_len as usize,
            handle_attached: self.handle_attached,
        }))
    }

    /// Copy the next chunk of the in-progress payload into `buffers`. Must
    /// only be called after [`MessageReader::begin`] returned `Some`. The
    /// last chunk is signaled by `finished = true`, not by a terminal call
    /// with empty buffers.
    pub fn read_chunk(
        &mut self,
        channel: &mut Channel,
        buffers: &mut [IoSliceMut<'_>],
    ) -> Result<ChunkOutcome> {
        let remaining = match self.state {
            ReaderState::ReadingPayload { remaining } => remaining,
            _ => return Err(Error::Api("read_chunk called without a pending message")),
        };

        let mut cursor = FillCursor::new(buffers);
        let copied = channel.receive_part_of_data(&mut cursor).min(remaining);
        let new_remaining = remaining - copied;
        channel.commit_receive();
        let crossed = channel.receive_water_mark_crossed_upward();
        let notify_writable = crossed && channel.test_and_reset_peer_writable_notification_request();

        let finished = new_remaining == 0;
        self.state = ReaderState::ReadingPayload {
            remaining: new_remaining,
        };
        if finished {
            self.reset();
        }

        Ok(ChunkOutcome {
            bytes: copied,
            finished,
            truncated: false,
            notify_writable,
        })
    }

    /// Abandon the rest of an in-progress chunked message, discarding
    /// whatever payload bytes remain (used when the caller's completion
    /// callback decides not to read the tail).
    pub fn discard_remaining(&mut self, channel: &mut Channel) -> usize {
        let remaining = match self.state {
            ReaderState::ReadingPayload { remaining } => remaining,
            _ => return 0,
        };
        let discarded = channel.discard_rest_of_data(remaining);
        channel.commit_receive();
        self.reset();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{direction_mapping_size, Side};
    use crate::shm::MappedRegion;
    use crate::wire::NOTIFICATION_REGION_SIZE;
    use std::io::{IoSlice, IoSliceMut};

    fn make_channels(capacity: u32) -> (Channel, Channel) {
        let c2s_server = MappedRegion::create("reader-c2s", direction_mapping_size(capacity)).unwrap();
        let c2s_client =
            MappedRegion::open(c2s_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let s2c_server = MappedRegion::create("reader-s2c", direction_mapping_size(capacity)).unwrap();
        let s2c_client =
            MappedRegion::open(s2c_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let notif_server = MappedRegion::create("reader-notif", NOTIFICATION_REGION_SIZE).unwrap();
        let notif_client =
            MappedRegion::open(notif_server.id().clone(), NOTIFICATION_REGION_SIZE).unwrap();
        (
            Channel::new(c2s_client, s2c_client, notif_client, Side::Client).unwrap(),
            Channel::new(c2s_server, s2c_server, notif_server, Side::Server).unwrap(),
        )
    }

    #[test]
    fn whole_message_round_trips() {
        let (mut client, mut server) = make_channels(512);
        client
            .send_common_header(MessageFormat::A, 5)
            .unwrap();
        let send_bufs = [IoSlice::new(b"hello")];
        let mut cursor = crate::buffer::DrainCursor::new(&send_bufs);
        client.send_part_of_data(&mut cursor);
        client.commit_send();

        server.update_local_view_on_receive().unwrap();
        let mut reader = MessageReader::new();
        let mut buf = [0u8; 5];
        let outcome = reader
            .receive_whole_message(&mut server, &mut [IoSliceMut::new(&mut buf)])
            .unwrap();
        assert_eq!(outcome.bytes, 5);
        assert!(!outcome.truncated);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn whole_message_busy_until_payload_arrives() {
        let (mut client, mut server) = make_channels(512);
        client.send_common_header(MessageFormat::A, 5).unwrap();
        client.commit_send();

        server.update_local_view_on_receive().unwrap();
        let mut reader = MessageReader::new();
        let mut buf = [0u8; 5];
        let err = reader
            .receive_whole_message(&mut server, &mut [IoSliceMut::new(&mut buf)])
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[test]
    fn whole_message_truncates_short_buffer() {
        let (mut client, mut server) = make_channels(512);
        client.send_common_header(MessageFormat::A, 5).unwrap();
        let send_bufs = [IoSlice::new(b"hello")];
        let mut cursor = crate::buffer::DrainCursor::new(&send_bufs);
        client.send_part_of_data(&mut cursor);
        client.commit_send();

        server.update_local_view_on_receive().unwrap();
        let mut reader = MessageReader::new();
        let mut buf = [0u8; 2];
        let outcome = reader
            .receive_whole_message(&mut server, &mut [IoSliceMut::new(&mut buf)])
            .unwrap();
        assert_eq!(outcome.bytes, 2);
        assert!(outcome.truncated);
        assert_eq!(server.receive_used_space(), 0);
    }

    #[test]
    fn chunked_receive_spans_multiple_reads() {
        let (mut client, mut server) = make_channels(512);
        client.send_common_header(MessageFormat::A, 9).unwrap();
        let send_bufs = [IoSlice::new(b"abcdefghi")];
        let mut cursor = crate::buffer::DrainCursor::new(&send_bufs);
        client.send_part_of_data(&mut cursor);
        client.commit_send();

        server.update_local_view_on_receive().unwrap();
        let mut reader = MessageReader::new();
        let pending = reader.begin(&mut server).unwrap().unwrap();
        assert_eq!(pending.payload_len, 9);

        let mut first = [0u8; 4];
        let step1 = reader
            .read_chunk(&mut server, &mut [IoSliceMut::new(&mut first)])
            .unwrap();
        assert_eq!(step1.bytes, 4);
        assert!(!step1.finished);

        let mut second = [0u8; 5];
        let step2 = reader
            .read_chunk(&mut server, &mut [IoSliceMut::new(&mut second)])
            .unwrap();
        assert_eq!(step2.bytes, 5);
        assert!(step2.finished);

        let mut all = Vec::new();
        all.extend_from_slice(&first);
        all.extend_from_slice(&second);
        assert_eq!(all, b"abcdefghi");
    }
}
