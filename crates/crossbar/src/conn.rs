use std::{fmt, net::SocketAddr};

use mio::Token;
use serde::{Deserialize, Serialize};

use crate::{frame::FrameBuffer, transport::Transport};

/// Tokens below this are reserved for the wake pipes and the listener.
pub(crate) const CONN_TOKEN_BASE: usize = 16;

/// Handle for one directed connection.
///
/// Allocated monotonically per bus and never reused, which also makes the
/// poll token derived from it unambiguous for the bus lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    #[inline]
    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize + CONN_TOKEN_BASE)
    }

    #[inline]
    pub(crate) fn from_token(token: Token) -> Self {
        Self((token.0 - CONN_TOKEN_BASE) as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Host/port pair a bus listens on or connects to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { host: addr.ip().to_string(), port: addr.port() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Connections leave the registry when they close, so a missing entry is the
/// closed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Outgoing connection whose socket does not exist yet.
    PendingConnect,
    /// Live socket whose first frame must be the auth token.
    AwaitingAuth,
    Established,
}

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub direction: Direction,
    pub state: ConnState,
    pub peer: Endpoint,
    /// Absent while `PendingConnect`.
    pub transport: Option<Transport>,
    pub frame_buf: FrameBuffer,
    /// Encoded frames waiting to go down the wire.
    pub write_buf: Vec<u8>,
    /// Payloads accepted before the outgoing socket existed. Non-empty only
    /// while `PendingConnect`; flushed in order on establishment.
    pub preconnect: Vec<Vec<u8>>,
    /// The IO loop has registered the socket with its poll.
    pub registered: bool,
    /// WRITABLE interest is currently registered.
    pub writable_armed: bool,
}

impl Connection {
    pub fn pending(id: ConnectionId, peer: Endpoint, extra_size_check: bool) -> Self {
        Self {
            id,
            direction: Direction::Outgoing,
            state: ConnState::PendingConnect,
            peer,
            transport: None,
            frame_buf: FrameBuffer::new(extra_size_check),
            write_buf: Vec::new(),
            preconnect: Vec::new(),
            registered: false,
            writable_armed: false,
        }
    }

    pub fn incoming(
        id: ConnectionId,
        peer: Endpoint,
        transport: Transport,
        needs_auth: bool,
        extra_size_check: bool,
    ) -> Self {
        Self {
            id,
            direction: Direction::Incoming,
            state: if needs_auth { ConnState::AwaitingAuth } else { ConnState::Established },
            peer,
            transport: Some(transport),
            frame_buf: FrameBuffer::new(extra_size_check),
            write_buf: Vec::new(),
            preconnect: Vec::new(),
            registered: false,
            writable_armed: false,
        }
    }
}
