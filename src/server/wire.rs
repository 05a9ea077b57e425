//! Wire-driver contract of the protocol servers
//!
//! The accept loop hands each socket to a [`WireFactory`]; the resulting
//! driver owns all protocol-specific framing (RTSP requests, RTMP chunking,
//! TLS, ...) and exposes the small surface the uniform connection actor
//! needs: negotiate an intent, then move units in one direction.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::RelayError;
use crate::stream::{MediaInfo, Unit};

/// What the client asked for during the protocol handshake.
pub enum WireIntent {
    Publish {
        path: String,
        query: String,
        user: Option<String>,
        pass: Option<String>,
        info: MediaInfo,
    },
    Read {
        path: String,
        query: String,
        user: Option<String>,
        pass: Option<String>,
        /// Requested track indices; `None` = every track.
        tracks: Option<Vec<usize>>,
    },
}

/// One protocol session over one socket.
#[async_trait]
pub trait WireConn: Send {
    /// Runs the protocol handshake up to the point where the client's intent
    /// is known.
    async fn begin(&mut self) -> io::Result<WireIntent>;

    /// Confirms the intent. Readers receive the media description.
    async fn accept(&mut self, info: Option<&MediaInfo>) -> io::Result<()>;

    /// Rejects the intent. Not-critical auth failures should surface as the
    /// protocol's credential challenge.
    async fn refuse(&mut self, reason: &RelayError) -> io::Result<()>;

    /// Publisher role: next unit from the wire; `None` on clean end of
    /// stream.
    async fn recv_unit(&mut self) -> io::Result<Option<Unit>>;

    /// Reader role: one unit to the wire.
    async fn send_unit(&mut self, unit: &Unit) -> io::Result<()>;
}

/// Builds a driver per accepted socket.
pub trait WireFactory: Send + Sync {
    fn open(&self, socket: TcpStream, addr: SocketAddr) -> Box<dyn WireConn>;
}
