//! Error types for the shared state table.

use std::io;

use crate::NodeId;

/// Errors raised by table, connection, and reply-tracking operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the transport provider or the side channel.
    Io(io::Error),
    /// The connection manager no longer holds a connection to the peer.
    ConnectionRemoved(NodeId),
    /// The connection to the peer exists but is flagged unusable.
    ConnectionBroken(NodeId),
    /// A peer reported an application-level exception while handling a call.
    RemoteException(NodeId),
    /// The peer was removed from the group before replying.
    NodeRemoved(NodeId),
    /// The peer id is not present in the configured address table.
    UnknownPeer(NodeId),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl Error {
    /// The peer a connection or reply error is scoped to, if any.
    pub fn peer(&self) -> Option<NodeId> {
        match self {
            Error::ConnectionRemoved(id)
            | Error::ConnectionBroken(id)
            | Error::RemoteException(id)
            | Error::NodeRemoved(id)
            | Error::UnknownPeer(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::ConnectionRemoved(id) => {
                write!(f, "connection to node {} has been removed", id)
            }
            Error::ConnectionBroken(id) => write!(f, "connection to node {} is broken", id),
            Error::RemoteException(id) => {
                write!(f, "an exception occurred at node with id {}", id)
            }
            Error::NodeRemoved(id) => {
                write!(f, "node with id {} has been removed from the group", id)
            }
            Error::UnknownPeer(id) => write!(f, "node {} is not in the address table", id),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for shared state table operations.
pub type Result<T> = std::result::Result<T, Error>;
