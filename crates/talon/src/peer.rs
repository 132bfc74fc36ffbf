//! Peer identity queries (`get_peer_process_id`/`get_peer_identity`/
//! `check_peer_integrity_level`).
//!
//! The real implementation of these is a `getsockopt(SO_PEERCRED)`-style
//! syscall on the control socket's file descriptor, an OS binding this
//! crate treats as an external collaborator rather than something to wrap
//! directly. This trait is the seam: a [`Connection`](crate::connection::Connection)
//! holds one as a trait object so the actual credential lookup can be
//! swapped in without touching connection/handshake logic.

/// A coarse, OS-independent standing for [`PeerCredentials::integrity_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntegrityLevel {
    Untrusted,
    Low,
    Medium,
    High,
    System,
}

/// Queries answerable from an already-established control socket.
pub trait PeerCredentials: Send {
    fn process_id(&self) -> Option<u32>;
    fn identity(&self) -> Option<String>;
    fn integrity_level(&self) -> Option<IntegrityLevel>;
}

/// A fixed set of credentials, for tests and for platforms where the real
/// query isn't wired up yet.
pub struct MockPeerCredentials {
    pub process_id: Option<u32>,
    pub identity: Option<String>,
    pub integrity_level: Option<IntegrityLevel>,
}

impl Default for MockPeerCredentials {
    fn default() -> Self {
        Self {
            process_id: Some(std::process::id()),
            identity: None,
            integrity_level: Some(IntegrityLevel::Medium),
        }
    }
}

impl PeerCredentials for MockPeerCredentials {
    fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn integrity_level(&self) -> Option<IntegrityLevel> {
        self.integrity_level
    }
}
