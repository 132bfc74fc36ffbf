//! Three-message connection establishment over the control socket.
//!
//! Independent of the rings, which don't exist yet when this runs: the
//! server creates all three shared-memory objects and hands their
//! identifiers to the client in message S1; the rings themselves are built
//! by [`crate::channel::Channel::new`] only after both sides have a mapping.

use crate::channel::{direction_mapping_size, Channel, Side};
use crate::error::{Error, Result};
use crate::shm::{MappedRegion, ShmId};
use crate::wire::{MIN_RING_SIZE, NOTIFICATION_REGION_SIZE, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn clamp_to_minimum(requested: u32) -> u32 {
    requested.max(MIN_RING_SIZE)
}

async fn write_string<S: AsyncWrite + Unpin>(stream: &mut S, value: &str) -> std::io::Result<()> {
    let bytes = value.as_bytes();
    stream.write_u16_le(bytes.len() as u16).await?;
    stream.write_all(bytes).await
}

async fn read_string<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let len = stream.read_u16_le().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "shm id not utf8"))
}

/// Client message 1: protocol version and both buffer-size requests.
struct ClientHello {
    version: u8,
    c2s_request: u32,
    s2c_request: u32,
}

impl ClientHello {
    async fn write<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> std::io::Result<()> {
        stream.write_u8(self.version).await?;
        stream.write_u32_le(self.c2s_request).await?;
        stream.write_u32_le(self.s2c_request).await
    }

    async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Self> {
        let version = stream.read_u8().await?;
        let c2s_request = stream.read_u32_le().await?;
        let s2c_request = stream.read_u32_le().await?;
        Ok(Self {
            version,
            c2s_request,
            s2c_request,
        })
    }
}

/// Server message 1: negotiated sizes and the three shared-memory identifiers.
struct ServerHello {
    version: u8,
    c2s_size: u32,
    s2c_size: u32,
    c2s_id: String,
    s2c_id: String,
    notification_id: String,
}

impl ServerHello {
    async fn write<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> std::io::Result<()> {
        stream.write_u8(self.version).await?;
        stream.write_u32_le(self.c2s_size).await?;
        stream.write_u32_le(self.s2c_size).await?;
        write_string(stream, &self.c2s_id).await?;
        write_string(stream, &self.s2c_id).await?;
        write_string(stream, &self.notification_id).await
    }

    async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Self> {
        let version = stream.read_u8().await?;
        let c2s_size = stream.read_u32_le().await?;
        let s2c_size = stream.read_u32_le().await?;
        let c2s_id = read_string(stream).await?;
        let s2c_id = read_string(stream).await?;
        let notification_id = read_string(stream).await?;
        Ok(Self {
            version,
            c2s_size,
            s2c_size,
            c2s_id,
            s2c_id,
            notification_id,
        })
    }
}

const CLIENT_ACK: u8 = 0xA5;

/// Outcome of a successful client-side handshake.
pub struct ClientHandshakeOutcome {
    pub channel: Channel,
    pub c2s_size: u32,
    pub s2c_size: u32,
}

/// Run the client side of the handshake: send the hello, read the server's
/// reply, map the three shared-memory objects it names, then ack.
pub async fn run_client<S>(stream: &mut S, c2s_hint: u32, s2c_hint: u32) -> Result<ClientHandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = ClientHello {
        version: PROTOCOL_VERSION,
        c2s_request: clamp_to_minimum(c2s_hint),
        s2c_request: clamp_to_minimum(s2c_hint),
    };
    hello.write(stream).await?;

    let reply = ServerHello::read(stream).await?;
    if reply.version != PROTOCOL_VERSION {
        return Err(Error::Api("server reported an unsupported protocol version"));
    }

    let c2s_region = MappedRegion::open(ShmId(reply.c2s_id), direction_mapping_size(reply.c2s_size))?;
    let s2c_region = MappedRegion::open(ShmId(reply.s2c_id), direction_mapping_size(reply.s2c_size))?;
    let notification_region =
        MappedRegion::open(ShmId(reply.notification_id), NOTIFICATION_REGION_SIZE)?;

    let channel = Channel::new(c2s_region, s2c_region, notification_region, Side::Client)?;

    stream.write_u8(CLIENT_ACK).await?;

    Ok(ClientHandshakeOutcome {
        channel,
        c2s_size: reply.c2s_size,
        s2c_size: reply.s2c_size,
    })
}

/// Server-side configuration for the handshake (`AcceptorConfig` slice).
#[derive(Debug, Clone, Copy)]
pub struct ServerHandshakeConfig {
    pub s2c_max: u32,
    pub handshake_timeout: Duration,
}

/// Outcome of a successful server-side handshake.
pub struct ServerHandshakeOutcome {
    pub channel: Channel,
    pub c2s_size: u32,
    pub s2c_size: u32,
}

/// Run the server side of the handshake, under `config`'s timeout. The
/// server creates and owns all three shared-memory objects; on any failure
/// they're dropped (and therefore unmapped/unlinked) before the error
/// propagates.
pub async fn run_server<S>(stream: &mut S, config: &ServerHandshakeConfig) -> Result<ServerHandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(config.handshake_timeout, run_server_inner(stream, config))
        .await
        .map_err(|_| Error::Api("handshake timed out"))?
}

async fn run_server_inner<S>(
    stream: &mut S,
    config: &ServerHandshakeConfig,
) -> Result<ServerHandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = ClientHello::read(stream).await?;
    if hello.version != PROTOCOL_VERSION {
        return Err(Error::Api("client requested an unsupported protocol version"));
    }

    let c2s_size = clamp_to_minimum(hello.c2s_request);
    let s2c_size = clamp_to_minimum(hello.s2c_request).min(config.s2c_max);

    let c2s_region = MappedRegion::create("c2s", direction_mapping_size(c2s_size))?;
    let s2c_region = MappedRegion::create("s2c", direction_mapping_size(s2c_size))?;
    let notification_region = MappedRegion::create("notif", NOTIFICATION_REGION_SIZE)?;

    let reply = ServerHello {
        version: PROTOCOL_VERSION,
        c2s_size,
        s2c_size,
        c2s_id: c2s_region.id().0.clone(),
        s2c_id: s2c_region.id().0.clone(),
        notification_id: notification_region.id().0.clone(),
    };
    reply.write(stream).await?;

    let ack = stream.read_u8().await?;
    if ack != CLIENT_ACK {
        return Err(Error::Protocol(crate::error::ProtocolError::UnknownControlByte));
    }

    let channel = Channel::new(c2s_region, s2c_region, notification_region, Side::Server)?;

    Ok(ServerHandshakeOutcome {
        channel,
        c2s_size,
        s2c_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_negotiates_requested_sizes() {
        let (mut client_stream, mut server_stream) = tokio::io::duplex(4096);
        let config = ServerHandshakeConfig {
            s2c_max: 8192,
            handshake_timeout: Duration::from_secs(1),
        };

        let server = tokio::spawn(async move { run_server(&mut server_stream, &config).await });
        let client = run_client(&mut client_stream, 4096, 4096).await.unwrap();
        let server = server.await.unwrap().unwrap();

        assert_eq!(client.c2s_size, 4096);
        assert_eq!(client.s2c_size, 4096);
        assert_eq!(server.c2s_size, 4096);
        assert_eq!(server.s2c_size, 4096);
    }

    #[tokio::test]
    async fn small_request_is_clamped_to_minimum() {
        let (mut client_stream, mut server_stream) = tokio::io::duplex(4096);
        let config = ServerHandshakeConfig {
            s2c_max: 8192,
            handshake_timeout: Duration::from_secs(1),
        };

        let server = tokio::spawn(async move { run_server(&mut server_stream, &config).await });
        let client = run_client(&mut client_stream, 16, 16).await.unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(client.s2c_size, MIN_RING_SIZE);
    }

    #[tokio::test]
    async fn s2c_request_is_capped_at_server_maximum() {
        let (mut client_stream, mut server_stream) = tokio::io::duplex(4096);
        let config = ServerHandshakeConfig {
            s2c_max: 2048,
            handshake_timeout: Duration::from_secs(1),
        };

        let server = tokio::spawn(async move { run_server(&mut server_stream, &config).await });
        let client = run_client(&mut client_stream, 4096, 100_000).await.unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(client.s2c_size, 2048);
    }
}
