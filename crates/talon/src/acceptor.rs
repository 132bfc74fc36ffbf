//! Listening side of a connection.
//!
//! Mirrors the accept-loop shape used elsewhere in this codebase for FD
//! handoff: a listener, an `accept().await` loop, one spawned task per
//! incoming connection that drives its own handshake independently so a
//! slow or hostile client can't stall the others.

use crate::connection::{accept_connection, Connection};
use crate::error::{Error, Result};
use crate::handshake::ServerHandshakeConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

/// Listening-side configuration.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Upper bound this acceptor will ever negotiate for a client's c2s ring
    /// request, independent of what the client asks for.
    pub s2c_max: u32,
    pub handshake_timeout: Duration,
    /// Backlog of accepted-but-not-yet-handshaken connections queued for a
    /// caller to pull from [`Acceptor::accept`].
    pub backlog: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            s2c_max: crate::wire::MIN_RING_SIZE * 16,
            handshake_timeout: Duration::from_secs(10),
            backlog: 16,
        }
    }
}

impl From<&AcceptorConfig> for ServerHandshakeConfig {
    fn from(config: &AcceptorConfig) -> Self {
        ServerHandshakeConfig {
            s2c_max: config.s2c_max,
            handshake_timeout: config.handshake_timeout,
        }
    }
}

/// Accepts incoming control-socket connections and drives each one's
/// handshake to completion in the background, handing back finished
/// [`Connection`]s through [`Acceptor::accept`].
pub struct Acceptor {
    rx: mpsc::Receiver<Result<Connection>>,
    accepted: Arc<AtomicUsize>,
}

impl Acceptor {
    /// Bind a Unix domain socket at `path` and start accepting. Returns once
    /// the socket is bound; the accept loop itself runs on a spawned task.
    pub fn bind(path: &std::path::Path, config: AcceptorConfig) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable => {
                Error::AddressNotAvailable
            }
            std::io::ErrorKind::PermissionDenied => Error::InsufficientPrivileges,
            _ => Error::Unexpected(e),
        })?;
        Ok(Self::from_listener(listener, config))
    }

    fn from_listener(listener: UnixListener, config: AcceptorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.backlog);
        let accepted = Arc::new(AtomicUsize::new(0));
        let handshake_config = ServerHandshakeConfig::from(&config);

        tokio::spawn(async move {
            loop {
                let (stream, _addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Unexpected(e))).await;
                        break;
                    }
                };
                spawn_handshake(stream, handshake_config, tx.clone());
            }
        });

        Self { rx, accepted }
    }

    /// Wait for the next fully-handshaken connection.
    pub async fn accept(&mut self) -> Result<Connection> {
        let result = self.rx.recv().await.ok_or(Error::Disconnected)?;
        if result.is_ok() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Number of connections this acceptor has successfully completed a
    /// handshake for since it was created.
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }
}

fn spawn_handshake<S>(stream: S, config: ServerHandshakeConfig, tx: mpsc::Sender<Result<Connection>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = accept_connection(stream, &config).await;
        let _ = tx.send(result).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IoSlice;
    use tokio::net::UnixStream as ClientUnixStream;

    #[tokio::test]
    async fn accepts_and_completes_handshake() {
        let dir = std::env::temp_dir().join(format!(
            "talon-acceptor-test-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&dir);

        let mut acceptor = Acceptor::bind(&dir, AcceptorConfig::default()).unwrap();

        let client_path = dir.clone();
        let client_task = tokio::spawn(async move {
            // The listener may not have started accepting yet; retry briefly.
            let stream = loop {
                match ClientUnixStream::connect(&client_path).await {
                    Ok(s) => break s,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            let client = Connection::new();
            client
                .connect_async(stream, crate::connection::ChannelConfig::default())
                .await
                .unwrap();
            client
        });

        let server_conn = acceptor.accept().await.unwrap();
        let client_conn = client_task.await.unwrap();

        client_conn.send_sync(&[IoSlice::new(b"hey")], false).unwrap();
        let mut buf = [0u8; 3];
        let n = loop {
            match server_conn.receive_sync(&mut [std::io::IoSliceMut::new(&mut buf)]) {
                Ok(n) => break n,
                Err(Error::Busy) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(n, 3);
        assert_eq!(&buf, b"hey");

        let _ = std::fs::remove_file(&dir);
    }
}
