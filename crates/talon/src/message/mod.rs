//! Message framing on top of [`crate::channel::Channel`].
//!
//! [`reader::MessageReader`] and [`writer::MessageWriter`] are the only two
//! things in this crate that know about the common header and format-B
//! header at the same time as the ring; everything below them is
//! framing-agnostic, everything above them (the Connection) only sees
//! decoded messages.

pub mod reader;
pub mod writer;

pub use reader::{ChunkOutcome, MessageReader, PendingMessage, WholeReceiveOutcome};
pub use writer::{MessageWriter, SendOutcome};
