//! Error taxonomy for client operations.

use std::io;
use std::sync::Arc;

/// Result alias used throughout the client.
pub type Result<T> = std::result::Result<T, Error>;

/// All the ways a client operation can fail.
///
/// The enum is `Clone` so the pool's sticky I/O-error latch can replay the
/// first transport failure on every subsequent call; this is why the `Io`
/// variant holds its `io::Error` behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Transport-level read/write failure. Fatal for the connection.
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A deadline elapsed. Socket timeouts are translated into this variant
    /// so callers can tell them apart from protocol errors.
    #[error("operation timed out")]
    Timeout,

    /// The Conn, Pool or Cluster this operation targeted has been closed.
    #[error("client is closed")]
    Closed,

    /// The peer violated RESP framing. Fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error reply from the server for a specific command. The
    /// connection remains usable.
    #[error("server error: {0}")]
    Server(String),

    /// `MOVED` redirect: the slot has been permanently reassigned.
    #[error("MOVED {slot} {host}:{port}")]
    Moved {
        /// Slot that moved.
        slot: u16,
        /// Host now owning the slot.
        host: String,
        /// Port of the new owner.
        port: u16,
    },

    /// `ASK` redirect: the key is temporarily served elsewhere during a
    /// migration. The retry must be preceded by `ASKING`.
    #[error("ASK {slot} {host}:{port}")]
    Ask {
        /// Slot being migrated.
        slot: u16,
        /// Host to ask.
        host: String,
        /// Port to ask.
        port: u16,
    },

    /// Connection establishment or unexpected peer shutdown.
    #[error("connection error: {0}")]
    Connection(String),

    /// The pool had no available connection within the configured window.
    #[error("pool is empty")]
    PoolEmpty,

    /// A multi-key command whose keys hash to more than one slot.
    #[error("keys hash to different slots")]
    CrossSlot,

    /// A reply could not be converted into the requested type.
    #[error("type error: {0}")]
    Type(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cluster-level failure: unusable topology, no reachable node.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// The post-connect AUTH handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Parse a server error reply, recognizing `MOVED` and `ASK` redirects.
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (kind, rest) = msg.split_once(' ')?;
        if kind != "MOVED" && kind != "ASK" {
            return None;
        }
        let (slot, addr) = rest.split_once(' ')?;
        let slot = slot.parse::<u16>().ok()?;
        let (host, port) = addr.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        Some(match kind {
            "MOVED" => Self::Moved {
                slot,
                host: host.to_string(),
                port,
            },
            _ => Self::Ask {
                slot,
                host: host.to_string(),
                port,
            },
        })
    }

    /// Whether this error is a `MOVED` or `ASK` redirect.
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// The `host:port` a redirect points at.
    #[must_use]
    pub fn redirect_target(&self) -> Option<String> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some(format!("{host}:{port}"))
            }
            _ => None,
        }
    }

    /// The slot a redirect refers to.
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Whether the connection that produced this error is still safe to
    /// reuse.
    ///
    /// Application-level replies (server errors, redirects) and local
    /// conversion failures leave the byte stream aligned; transport
    /// failures, framing violations and timeouts may have left a partial
    /// frame behind and poison the connection.
    #[must_use]
    pub const fn is_connection_usable(&self) -> bool {
        matches!(
            self,
            Self::Server(_)
                | Self::Moved { .. }
                | Self::Ask { .. }
                | Self::Type(_)
                | Self::CrossSlot
        )
    }
}
