//! Top-level connection lifecycle.
//!
//! All mutable state lives behind one `std::sync::Mutex` (critical sections
//! are short: cached-counter arithmetic and small memcpys, never I/O), so
//! synchronous APIs may be called from any thread. Async completions run on
//! a spawned task per pending operation, polling the ring with
//! `tokio::time::sleep` between attempts rather than through a true
//! edge-triggered reactor, since the reactor itself is an external
//! collaborator.
//!
//! Any `Error::Protocol(_)` surfaced by a ring/header operation makes the
//! connection sticky: once the peer or the local side has produced bytes
//! that don't decode, there is no well-defined place left to resume reading
//! from, so every send/receive entry point marks the connection
//! `ProtocolError` before propagating that error.

use crate::channel::Channel;
use crate::error::{Error, ProtocolError, Result};
use crate::handshake::{self, ServerHandshakeConfig};
use crate::message::{
    ChunkOutcome, MessageReader, MessageWriter, PendingMessage, SendOutcome, WholeReceiveOutcome,
};
use crate::peer::PeerCredentials;
use crate::wire::ControlByte;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectingSubState {
    AwaitingConnect,
    SendingM1,
    AwaitingS1,
    SendingM2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransferSubState {
    SendAndReceive,
    ReceiveOnly,
    Disconnected,
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopState {
    Closed,
    Connecting(ConnectingSubState),
    Connected(DataTransferSubState),
    ConnectError,
}

/// Requested ring sizes for a client connection (`ChannelConfig`).
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub c2s_size_hint: u32,
    pub s2c_size_hint: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            c2s_size_hint: crate::wire::MIN_RING_SIZE * 4,
            s2c_size_hint: crate::wire::MIN_RING_SIZE * 4,
        }
    }
}

enum OutgoingByte {
    Control(u8),
    UserNotification(u8),
}

struct State {
    top: TopState,
    channel: Option<Channel>,
    reader: MessageReader,
    writer: MessageWriter,
    notification_callback: Option<Box<dyn FnMut(u8) + Send>>,
    peer_credentials: Option<Box<dyn PeerCredentials>>,
    in_use_callbacks: u32,
}

impl State {
    fn new() -> Self {
        Self {
            top: TopState::Closed,
            channel: None,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
            notification_callback: None,
            peer_credentials: None,
            in_use_callbacks: 0,
        }
    }

    fn sticky_error(&self) -> Option<Error> {
        match self.top {
            TopState::Connected(DataTransferSubState::Disconnected) => Some(Error::Disconnected),
            TopState::Connected(DataTransferSubState::ProtocolError) => {
                Some(Error::Protocol(ProtocolError::InvalidRingIndex))
            }
            _ => None,
        }
    }

    /// A ring/header operation that fails with `Error::Protocol(_)` has left
    /// the ring's local read or write cursor in a position that isn't safe
    /// to resume from, so that error always makes the connection sticky.
    /// Every other error is returned as-is without touching `top`.
    fn note_protocol_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Protocol(_)) = &result {
            self.top = TopState::Connected(DataTransferSubState::ProtocolError);
        }
        result
    }

    fn require_channel(&mut self) -> Result<&mut Channel> {
        if let Some(err) = self.sticky_error() {
            return Err(err);
        }
        match self.top {
            TopState::Connected(DataTransferSubState::SendAndReceive)
            | TopState::Connected(DataTransferSubState::ReceiveOnly) => {
                self.channel.as_mut().ok_or(Error::Uninitialized)
            }
            _ => Err(Error::Uninitialized),
        }
    }
}

fn send_inner(
    channel: &mut Channel,
    writer: &mut MessageWriter,
    buffers: &[IoSlice<'_>],
    attach_handle: bool,
) -> Result<SendOutcome> {
    channel.update_local_view_on_send()?;
    writer.send_whole(channel, buffers, attach_handle)
}

fn receive_inner(
    channel: &mut Channel,
    reader: &mut MessageReader,
    buffers: &mut [IoSliceMut<'_>],
) -> Result<WholeReceiveOutcome> {
    channel.update_local_view_on_receive()?;
    reader.receive_whole_message(channel, buffers)
}

fn begin_inner(channel: &mut Channel, reader: &mut MessageReader) -> Result<Option<PendingMessage>> {
    channel.update_local_view_on_receive()?;
    reader.begin(channel)
}

fn chunk_inner(
    channel: &mut Channel,
    reader: &mut MessageReader,
    buffers: &mut [IoSliceMut<'_>],
) -> Result<ChunkOutcome> {
    channel.update_local_view_on_receive()?;
    reader.read_chunk(channel, buffers)
}

/// Top-level lifecycle object. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connection {
    state: Arc<Mutex<State>>,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<OutgoingByte>>>>,
    closed: Arc<AtomicBool>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            outgoing: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin a connection over an already-established control-socket stream.
    /// Fails immediately with `AlreadyConnected` if not currently `Closed`.
    pub async fn connect_async<S>(&self, mut stream: S, config: ChannelConfig) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(state.top, TopState::Closed) {
                return Err(Error::AlreadyConnected);
            }
            state.top = TopState::Connecting(ConnectingSubState::SendingM1);
        }

        let outcome = handshake::run_client(&mut stream, config.c2s_size_hint, config.s2c_size_hint).await;

        let mut state = self.state.lock().unwrap();
        match outcome {
            Ok(ok) => {
                tracing::debug!(
                    c2s_size = ok.c2s_size,
                    s2c_size = ok.s2c_size,
                    "connection established"
                );
                state.channel = Some(ok.channel);
                state.top = TopState::Connected(DataTransferSubState::SendAndReceive);
                drop(state);
                self.spawn_control_loop(stream);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "handshake failed");
                state.top = TopState::ConnectError;
                Err(err)
            }
        }
    }

    fn spawn_control_loop<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader_half, mut writer_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingByte>();
        *self.outgoing.lock().unwrap() = Some(tx);

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let written = match item {
                    OutgoingByte::Control(b) => writer_half.write_all(&[b]).await,
                    OutgoingByte::UserNotification(v) => {
                        writer_half
                            .write_all(&[ControlByte::UserNotificationPrefix.as_byte(), v])
                            .await
                    }
                };
                // A peer that already closed its read half is not an error
                // for this best-effort wakeup channel.
                if written.is_err() {
                    break;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.closed.load(Ordering::Acquire) {
                    break;
                }
                let byte = match reader_half.read_u8().await {
                    Ok(b) => b,
                    Err(_) => {
                        this.on_peer_gone();
                        break;
                    }
                };
                match ControlByte::from_byte(byte) {
                    Some(ControlByte::ReadWriteNotification) => {
                        // Wakeup only; state is re-examined by whoever
                        // calls the sync APIs next. Nothing to do here but
                        // keep the loop alive.
                    }
                    Some(ControlByte::OrderlyClose) => this.on_peer_orderly_close(),
                    Some(ControlByte::UserNotificationPrefix) => {
                        let value = match reader_half.read_u8().await {
                            Ok(v) => v,
                            Err(_) => {
                                this.on_peer_gone();
                                break;
                            }
                        };
                        this.dispatch_notification(value);
                    }
                    None => {
                        this.on_protocol_error();
                        break;
                    }
                }
            }
        });
    }

    fn on_peer_gone(&self) {
        let mut state = self.state.lock().unwrap();
        if let TopState::Connected(sub) = state.top {
            if sub != DataTransferSubState::Disconnected {
                tracing::debug!(from = ?sub, "control socket closed, marking disconnected");
                state.top = TopState::Connected(DataTransferSubState::Disconnected);
            }
        }
    }

    fn on_peer_orderly_close(&self) {
        let mut state = self.state.lock().unwrap();
        if let TopState::Connected(_) = state.top {
            let receive_empty = state
                .channel
                .as_ref()
                .map(|c| c.receive_used_space() == 0)
                .unwrap_or(true);
            let next = if receive_empty {
                DataTransferSubState::Disconnected
            } else {
                DataTransferSubState::ReceiveOnly
            };
            tracing::debug!(?next, "peer sent orderly close");
            state.top = TopState::Connected(next);
        }
    }

    fn on_protocol_error(&self) {
        tracing::warn!("control socket carried an unrecognized byte");
        let mut state = self.state.lock().unwrap();
        state.top = TopState::Connected(DataTransferSubState::ProtocolError);
    }

    fn dispatch_notification(&self, value: u8) {
        let mut state = self.state.lock().unwrap();
        state.in_use_callbacks += 1;
        let cb = state.notification_callback.as_mut();
        if let Some(cb) = cb {
            cb(value);
        }
        state.in_use_callbacks -= 1;
    }

    fn send_wakeup(&self) {
        if let Some(tx) = self.outgoing.lock().unwrap().as_ref() {
            let _ = tx.send(OutgoingByte::Control(ControlByte::ReadWriteNotification.as_byte()));
        }
    }

    fn mark_waiting_for_writable(&self) {
        let mut state = self.state.lock().unwrap();
        if let Ok(channel) = state.require_channel() {
            channel.request_writable_notification();
        }
    }

    fn clear_waiting_for_writable(&self) {
        let mut state = self.state.lock().unwrap();
        if let Ok(channel) = state.require_channel() {
            channel.reset_writable_notification_request();
        }
    }

    fn mark_waiting_for_readable(&self) {
        let mut state = self.state.lock().unwrap();
        if let Ok(channel) = state.require_channel() {
            channel.request_readable_notification();
        }
    }

    fn clear_waiting_for_readable(&self) {
        let mut state = self.state.lock().unwrap();
        if let Ok(channel) = state.require_channel() {
            channel.reset_readable_notification_request();
        }
    }

    /// Attempt a whole-message send without blocking.
    pub fn send_sync(&self, buffers: &[IoSlice<'_>], attach_handle: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.require_channel()?;
        let State { channel, writer, .. } = &mut *state;
        let channel = channel.as_mut().unwrap();
        let result = send_inner(channel, writer, buffers, attach_handle);
        let outcome = state.note_protocol_error(result)?;
        let notify = outcome.notify_readable;
        drop(state);
        if notify {
            self.send_wakeup();
        }
        Ok(())
    }

    /// Try `send_sync` first; on `Busy`, poll in the background and invoke
    /// `callback` once the send succeeds or fails terminally.
    pub fn send(
        &self,
        buffers: Vec<u8>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        match self.send_sync(&[IoSlice::new(&buffers)], false) {
            Ok(()) => callback(Ok(())),
            Err(Error::Busy) => self.send_async(buffers, callback),
            Err(e) => callback(Err(e)),
        }
    }

    /// Always-asynchronous send: retries on a background task until it
    /// succeeds or hits a terminal error, arming the channel's
    /// writable-notification request for the duration of the wait so the
    /// peer's next receive wakes this side up instead of leaving it to poll
    /// blind.
    pub fn send_async(&self, buffers: Vec<u8>, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.send_sync(&[IoSlice::new(&buffers)], false) {
                    Ok(()) => {
                        this.clear_waiting_for_writable();
                        return callback(Ok(()));
                    }
                    Err(Error::Busy) => {
                        this.mark_waiting_for_writable();
                        tokio::time::sleep(Duration::from_micros(200)).await;
                    }
                    Err(e) => {
                        this.clear_waiting_for_writable();
                        return callback(Err(e));
                    }
                }
            }
        });
    }

    /// Whole-message receive without blocking.
    pub fn receive_sync(&self, buffers: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.require_channel()?;
        let State { channel, reader, .. } = &mut *state;
        let channel = channel.as_mut().unwrap();
        let result = receive_inner(channel, reader, buffers);
        let outcome = state.note_protocol_error(result)?;
        let notify_writable = outcome.notify_writable;
        drop(state);
        if notify_writable {
            self.send_wakeup();
        }
        // The bytes that fit are already in the caller's buffers; truncation
        // is reported as a flag on the byte count, not a swallowed error, so
        // the caller keeps what arrived.
        if outcome.truncated {
            return Err(Error::Truncation {
                received: outcome.bytes,
                expected: outcome.payload_len,
            });
        }
        Ok(outcome.bytes)
    }

    /// Peek the size of the next pending message without consuming it. A
    /// subsequent `receive_sync` may still legitimately return `Busy` if the
    /// payload hasn't fully arrived yet — the peek only looks at the header.
    pub fn get_pending_message_size(&self) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.require_channel()?;
        let result = state.channel.as_mut().unwrap().update_local_view_on_receive();
        state.note_protocol_error(result)?;
        state
            .channel
            .as_ref()
            .unwrap()
            .peek_common_header()
            .map(|h| h.payload_len as usize)
            .ok_or(Error::Busy)
    }

    /// Decode the next message's headers without consuming its payload,
    /// entering chunked-receive mode. Returns `Ok(None)` if the headers
    /// haven't fully arrived; call again later rather than polling
    /// [`Connection::receive_chunk_sync`] early.
    pub fn begin_receive_chunked(&self) -> Result<Option<PendingMessage>> {
        let mut state = self.state.lock().unwrap();
        state.require_channel()?;
        let State { channel, reader, .. } = &mut *state;
        let channel = channel.as_mut().unwrap();
        let result = begin_inner(channel, reader);
        state.note_protocol_error(result)
    }

    /// Copy the next chunk of the message started by
    /// [`Connection::begin_receive_chunked`] into `buffers`.
    pub fn receive_chunk_sync(&self, buffers: &mut [IoSliceMut<'_>]) -> Result<ChunkOutcome> {
        let mut state = self.state.lock().unwrap();
        state.require_channel()?;
        let State { channel, reader, .. } = &mut *state;
        let channel = channel.as_mut().unwrap();
        let result = chunk_inner(channel, reader, buffers);
        let outcome = state.note_protocol_error(result)?;
        let notify_writable = outcome.notify_writable;
        drop(state);
        if notify_writable {
            self.send_wakeup();
        }
        Ok(outcome)
    }

    /// Asynchronous whole-message receive: polls `receive_sync` on a
    /// background task into a fixed-size scratch buffer until a message
    /// arrives or a terminal error occurs, then hands the filled prefix to
    /// `callback`. Arms the channel's readable-notification request for the
    /// duration of the wait.
    pub fn receive_async_whole(
        &self,
        buf_size: usize,
        callback: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; buf_size];
            loop {
                match this.receive_sync(&mut [IoSliceMut::new(&mut buf)]) {
                    Ok(n) => {
                        this.clear_waiting_for_readable();
                        buf.truncate(n);
                        return callback(Ok(buf));
                    }
                    Err(Error::Busy) => {
                        this.mark_waiting_for_readable();
                        tokio::time::sleep(Duration::from_micros(200)).await;
                    }
                    Err(e) => {
                        this.clear_waiting_for_readable();
                        return callback(Err(e));
                    }
                }
            }
        });
    }

    /// Asynchronous chunked receive: polls for a pending message, then
    /// drains its payload chunk by chunk (each chunk up to `chunk_size`
    /// bytes), invoking `on_chunk` per chunk and `on_complete` once the
    /// message is fully drained or a terminal error occurs. Arms the
    /// channel's readable-notification request for the duration of each wait.
    pub fn receive_async_chunked(
        &self,
        chunk_size: usize,
        mut on_chunk: impl FnMut(Vec<u8>) + Send + 'static,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.begin_receive_chunked() {
                    Ok(Some(_)) => {
                        this.clear_waiting_for_readable();
                        break;
                    }
                    Ok(None) => {
                        this.mark_waiting_for_readable();
                        tokio::time::sleep(Duration::from_micros(200)).await;
                    }
                    Err(e) => return on_complete(Err(e)),
                }
            }
            loop {
                let mut buf = vec![0u8; chunk_size];
                match this.receive_chunk_sync(&mut [IoSliceMut::new(&mut buf)]) {
                    Ok(outcome) => {
                        buf.truncate(outcome.bytes);
                        if !buf.is_empty() {
                            on_chunk(buf);
                        }
                        if outcome.finished {
                            this.clear_waiting_for_readable();
                            return on_complete(Ok(()));
                        }
                        if outcome.bytes == 0 {
                            this.mark_waiting_for_readable();
                            tokio::time::sleep(Duration::from_micros(200)).await;
                        } else {
                            this.clear_waiting_for_readable();
                        }
                    }
                    Err(e) => {
                        this.clear_waiting_for_readable();
                        return on_complete(Err(e));
                    }
                }
            }
        });
    }

    /// Send a single-byte user notification over the control socket.
    /// Values above [`crate::wire::MAX_USER_NOTIFICATION_VALUE`] are a
    /// caller-contract error.
    pub fn send_notification(&self, value: u8) -> Result<()> {
        if value > crate::wire::MAX_USER_NOTIFICATION_VALUE {
            return Err(Error::Api("user notification value out of range"));
        }
        let tx = self.outgoing.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .send(OutgoingByte::UserNotification(value))
                .map_err(|_| Error::Disconnected),
            None => Err(Error::Uninitialized),
        }
    }

    pub fn register_notification_callback(&self, callback: impl FnMut(u8) + Send + 'static) {
        self.state.lock().unwrap().notification_callback = Some(Box::new(callback));
    }

    pub fn unregister_notification_callback(&self) {
        self.state.lock().unwrap().notification_callback = None;
    }

    pub fn set_peer_credentials(&self, credentials: Box<dyn PeerCredentials>) {
        self.state.lock().unwrap().peer_credentials = Some(credentials);
    }

    pub fn get_peer_process_id(&self) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .peer_credentials
            .as_ref()
            .and_then(|c| c.process_id())
    }

    pub fn get_peer_identity(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .peer_credentials
            .as_ref()
            .and_then(|c| c.identity())
    }

    pub fn check_peer_integrity_level(&self, min: crate::peer::IntegrityLevel) -> bool {
        self.state
            .lock()
            .unwrap()
            .peer_credentials
            .as_ref()
            .and_then(|c| c.integrity_level())
            .map(|level| level >= min)
            .unwrap_or(false)
    }

    pub fn get_send_buffer_size(&self) -> Result<u32> {
        let state = self.state.lock().unwrap();
        state
            .channel
            .as_ref()
            .map(|c| c.send_capacity())
            .ok_or(Error::Uninitialized)
    }

    pub fn get_receive_buffer_size(&self) -> Result<u32> {
        let state = self.state.lock().unwrap();
        state
            .channel
            .as_ref()
            .map(|c| c.receive_capacity())
            .ok_or(Error::Uninitialized)
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state.lock().unwrap().top, TopState::Closed)
    }

    pub fn is_in_use(&self) -> bool {
        self.state.lock().unwrap().in_use_callbacks > 0
    }

    /// Release all resources; cancels pending async operations. Sends an
    /// orderly-close byte to the peer first, so it can drain whatever is
    /// still sitting in the ring instead of treating this like a crash.
    /// Idempotent: calling `close` on a `Closed` connection is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        if matches!(state.top, TopState::Closed) {
            return;
        }
        state.top = TopState::Closed;
        state.channel = None;
        state.notification_callback = None;
        drop(state);
        if let Some(tx) = self.outgoing.lock().unwrap().take() {
            let _ = tx.send(OutgoingByte::Control(ControlByte::OrderlyClose.as_byte()));
        }
    }

    /// Like [`Connection::close`], but panics if a callback is mid-execution
    /// — for callers that must prove no reentrancy is possible.
    pub fn close_and_assert_no_callback_executing(&self) {
        assert!(!self.is_in_use(), "a callback is still executing");
        self.close();
    }
}

/// Run the server side of a handshake and return a freshly `Connected`
/// [`Connection`] (used by [`crate::acceptor::Acceptor`]).
pub(crate) async fn accept_connection<S>(
    mut stream: S,
    config: &ServerHandshakeConfig,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outcome = handshake::run_server(&mut stream, config).await?;
    let conn = Connection::new();
    {
        let mut state = conn.state.lock().unwrap();
        state.channel = Some(outcome.channel);
        state.top = TopState::Connected(DataTransferSubState::SendAndReceive);
    }
    conn.spawn_control_loop(stream);
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_and_receives_a_whole_message() {
        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            let config = ServerHandshakeConfig {
                s2c_max: 8192,
                handshake_timeout: Duration::from_secs(1),
            };
            accept_connection(server_stream, &config).await
        });

        let client_conn = Connection::new();
        client_conn
            .connect_async(client_stream, ChannelConfig::default())
            .await
            .unwrap();

        let server_conn = server_task.await.unwrap().unwrap();

        client_conn.send_sync(&[IoSlice::new(b"hi")], false).unwrap();

        let mut buf = [0u8; 2];
        // The control loop hasn't necessarily delivered a wakeup yet; retry
        // like the async send/receive paths do.
        let n = loop {
            match server_conn.receive_sync(&mut [IoSliceMut::new(&mut buf)]) {
                Ok(n) => break n,
                Err(Error::Busy) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn receive_async_whole_delivers_a_message_sent_later() {
        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            let config = ServerHandshakeConfig {
                s2c_max: 8192,
                handshake_timeout: Duration::from_secs(1),
            };
            accept_connection(server_stream, &config).await
        });

        let client_conn = Connection::new();
        client_conn
            .connect_async(client_stream, ChannelConfig::default())
            .await
            .unwrap();
        let server_conn = server_task.await.unwrap().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        server_conn.receive_async_whole(8, |result| {
            let _ = tx.send(result);
        });

        client_conn.send_sync(&[IoSlice::new(b"async")], false).unwrap();

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received, b"async");
    }

    #[tokio::test]
    async fn receive_async_chunked_drains_a_message_in_pieces() {
        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            let config = ServerHandshakeConfig {
                s2c_max: 8192,
                handshake_timeout: Duration::from_secs(1),
            };
            accept_connection(server_stream, &config).await
        });

        let client_conn = Connection::new();
        client_conn
            .connect_async(client_stream, ChannelConfig::default())
            .await
            .unwrap();
        let server_conn = server_task.await.unwrap().unwrap();

        client_conn
            .send_sync(&[IoSlice::new(b"abcdefghi")], false)
            .unwrap();

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let chunks_for_callback = chunks.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        server_conn.receive_async_chunked(
            4,
            move |chunk| chunks_for_callback.lock().unwrap().push(chunk),
            |result| {
                let _ = tx.send(result);
            },
        );

        rx.await.unwrap().unwrap();
        let collected: Vec<u8> = chunks.lock().unwrap().concat();
        assert_eq!(collected, b"abcdefghi");
    }

    #[test]
    fn close_on_closed_connection_is_a_no_op() {
        let conn = Connection::new();
        conn.close();
        conn.close();
        assert!(!conn.is_open());
    }
}
