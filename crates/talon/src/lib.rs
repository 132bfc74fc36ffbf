//! Point-to-point, message-oriented IPC transport between two local
//! processes, built on lock-free SPSC shared-memory ring buffers with a
//! control socket carrying the handshake and out-of-band wakeups.
//!
//! A [`connection::Connection`] is the thing applications hold: it owns a
//! [`channel::Channel`] (the rings plus the notification region) once the
//! [`handshake`] completes, and frames messages through [`message`]'s
//! reader/writer pair. [`acceptor::Acceptor`] is the listening side.
//!
//! Nothing here allocates a shared-memory segment before a peer asks for one,
//! and nothing holds a lock across an `.await` point — the mutex in
//! [`connection::Connection`] only ever guards pointer arithmetic and small
//! memcpys.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod ring;
pub mod shm;
pub mod wire;

pub use acceptor::{Acceptor, AcceptorConfig};
pub use connection::{ChannelConfig, Connection};
pub use error::{Error, ProtocolError, Result};
pub use peer::{IntegrityLevel, MockPeerCredentials, PeerCredentials};
