//! Stateful message encoder. Simpler than the reader: there is no
//! ambiguity about how many bytes are coming, since the caller always knows
//! its own payload length up front.

use crate::buffer::DrainCursor;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::wire::{FormatBClass, MessageFormat, COMMON_HEADER_SIZE, FORMAT_B_HEADER_SIZE};
use std::io::IoSlice;

/// Result of a successful send.
#[derive(Debug)]
pub struct SendOutcome {
    pub bytes: usize,
    /// Whether the peer had an outstanding readable-notification request
    /// that this send just satisfied — the Connection should wake it.
    pub notify_readable: bool,
}

/// Encoder for one message at a time; holds no state between calls.
#[derive(Default)]
pub struct MessageWriter;

impl MessageWriter {
    pub fn new() -> Self {
        Self
    }

    /// All-or-nothing send: writes the common header, an optional format-B
    /// header, and the whole payload, or writes nothing at all.
    pub fn send_whole(
        &mut self,
        channel: &mut Channel,
        buffers: &[IoSlice<'_>],
        attach_handle: bool,
    ) -> Result<SendOutcome> {
        let payload_len = DrainCursor::total_len(buffers);
        let format = if attach_handle {
            MessageFormat::B
        } else {
            MessageFormat::A
        };
        let header_len = COMMON_HEADER_SIZE
            + match format {
                MessageFormat::A => 0,
                MessageFormat::B => FORMAT_B_HEADER_SIZE,
            };
        let needed = header_len + payload_len;

        if needed as u32 > channel.send_capacity() {
            return Err(Error::Size);
        }
        channel.update_local_view_on_send()?;
        if (channel.send_free_space() as usize) < needed {
            return Err(Error::Busy);
        }

        channel.send_common_header(format, payload_len as u32)?;
        if attach_handle {
            channel.send_format_b_header(FormatBClass::HandleAttached)?;
        }

        let mut cursor = DrainCursor::new(buffers);
        let written = channel.send_part_of_data(&mut cursor);
        channel.commit_send();

        let notify_readable = channel.test_and_reset_peer_readable_notification_request();
        Ok(SendOutcome {
            bytes: written,
            notify_readable,
        })
    }

    /// Best-effort streaming write of `buffers`, with no header: callers use
    /// this to push additional payload bytes for a message whose header was
    /// already written by a previous `send_whole`/header-only call. Returns
    /// the number of bytes actually accepted.
    pub fn send_part(&mut self, channel: &mut Channel, buffers: &[IoSlice<'_>]) -> Result<usize> {
        channel.update_local_view_on_send()?;
        let mut cursor = DrainCursor::new(buffers);
        let written = channel.send_part_of_data(&mut cursor);
        channel.commit_send();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{direction_mapping_size, Side};
    use crate::message::reader::MessageReader;
    use crate::shm::MappedRegion;
    use crate::wire::NOTIFICATION_REGION_SIZE;
    use std::io::IoSliceMut;

    fn make_channels(capacity: u32) -> (Channel, Channel) {
        let c2s_server = MappedRegion::create("writer-c2s", direction_mapping_size(capacity)).unwrap();
        let c2s_client =
            MappedRegion::open(c2s_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let s2c_server = MappedRegion::create("writer-s2c", direction_mapping_size(capacity)).unwrap();
        let s2c_client =
            MappedRegion::open(s2c_server.id().clone(), direction_mapping_size(capacity)).unwrap();
        let notif_server = MappedRegion::create("writer-notif", NOTIFICATION_REGION_SIZE).unwrap();
        let notif_client =
            MappedRegion::open(notif_server.id().clone(), NOTIFICATION_REGION_SIZE).unwrap();
        (
            Channel::new(c2s_client, s2c_client, notif_client, Side::Client).unwrap(),
            Channel::new(c2s_server, s2c_server, notif_server, Side::Server).unwrap(),
        )
    }

    #[test]
    fn send_whole_then_receive_whole() {
        let (mut client, mut server) = make_channels(256);
        let mut writer = MessageWriter::new();
        let outcome = writer
            .send_whole(&mut client, &[IoSlice::new(b"ping")], false)
            .unwrap();
        assert_eq!(outcome.bytes, 4);

        server.update_local_view_on_receive().unwrap();
        let mut reader = MessageReader::new();
        let mut buf = [0u8; 4];
        let received = reader
            .receive_whole_message(&mut server, &mut [IoSliceMut::new(&mut buf)])
            .unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(received.bytes, 4);
    }

    #[test]
    fn send_whole_rejects_oversized_payload() {
        let (mut client, _server) = make_channels(32);
        let mut writer = MessageWriter::new();
        let big = vec![0u8; 64];
        let err = writer
            .send_whole(&mut client, &[IoSlice::new(&big)], false)
            .unwrap_err();
        assert!(matches!(err, Error::Size));
    }

    #[test]
    fn send_whole_reports_busy_when_full() {
        let (mut client, _server) = make_channels(32);
        let mut writer = MessageWriter::new();
        // First message fits (8 header + 20 payload = 28 <= 32).
        writer
            .send_whole(&mut client, &[IoSlice::new(&[0u8; 20])], false)
            .unwrap();
        // Second one doesn't: no receiver has drained anything yet.
        let err = writer
            .send_whole(&mut client, &[IoSlice::new(&[0u8; 20])], false)
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
    }
}
