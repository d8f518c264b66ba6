//! Network UMP session
//!
//! The bridge only relies on the [`NetworkSession`] contract: open the session, run one
//! service iteration, send a packet, close. Packets arriving from the peer are handed to the
//! [`UmpSink`] registered when the session is created.
//!
//! - [`UdpSession`] speaks a minimal Network MIDI 2.0 over UDP
//! - [`MockSessionFactory`] builds scriptable sessions for tests
//!
pub mod mock_session;
mod udp_session;
pub mod wire;

pub use mock_session::{MockNetwork, MockSessionFactory};
pub use udp_session::{UdpSession, UdpSessionFactory};

use crate::ump::UmpPacket;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Product instance identifier announced to peers
pub const PRODUCT_INSTANCE_ID: &str = "UMPB_001";

/// Well-known UDP port for Network MIDI 2.0 sessions
pub const SESSION_PORT: u16 = 5504;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not resolve host '{host}': {reason}")]
    Resolve { host: String, reason: String },
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("invitation rejected by peer: {0}")]
    Rejected(String),
    #[error("session is not established")]
    NotEstablished,
    #[error("session closed by peer")]
    ClosedByPeer,
    #[error("session failed: {0}")]
    Failed(String),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Receives packets the session takes off the wire.
///
/// Called from inside [`NetworkSession::run_once`]; implementations must not block for long.
pub trait UmpSink: Send + Sync {
    fn on_packet(&self, packet: &UmpPacket);
}

/// A live network UMP session.
///
/// One thread may call [`send`](Self::send) while another drives
/// [`run_once`](Self::run_once).
pub trait NetworkSession: Send + Sync {
    /// Performs the handshake with the peer.
    fn open(&self) -> Result<()>;

    /// Runs one protocol iteration, blocking for at most the service timeout.
    ///
    /// An error means the session cannot continue.
    fn run_once(&self) -> Result<()>;

    fn send(&self, packet: &UmpPacket) -> Result<()>;

    /// Ends the session gracefully. A closed session is never reopened.
    fn close(&self);
}

/// Builds a fresh session for each bridge start
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        params: &SessionParams,
        sink: Arc<dyn UmpSink>,
    ) -> Result<Arc<dyn NetworkSession>>;
}

/// Everything needed to construct a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub product_instance_id: String,
    pub endpoint_name: String,
    pub destination: SocketAddr,
    pub local_port: u16,
    /// This side sends the invitation
    pub initiator: bool,
    pub service_timeout: Duration,
    pub handshake_timeout: Duration,
}

/// Resolves a host name or address literal, preferring IPv4.
pub fn resolve_destination(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| SessionError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SessionError::Resolve {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        })
}
