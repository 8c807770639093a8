// CONODE OVERLAY NETWORK
// Rosters, communication trees and the per-session runtime that drives
// protocol state machines between conodes.
//
// SAFETY INVARIANTS:
// 1. A protocol instance only ever sees messages of its own session
// 2. Messages for a finished session are dropped, never re-instantiated
// 3. Every run is bounded by a wall-clock timeout

pub mod identity;
pub mod local;
pub mod network;
pub mod protocol;
pub mod server;
pub mod tree;

use thiserror::Error;

pub use conode_crypto::Hash256;
pub use identity::{Roster, ServerId, ServerIdentity};
pub use local::LocalCothority;
pub use network::{Envelope, LocalNetwork, SessionId, Transport};
pub use protocol::{Destination, Protocol, Status, Step, Transition};
pub use server::{Server, TreeNodeInstance};
pub use tree::Tree;

#[derive(Debug, Error)]
pub enum OnetError {
    #[error("protocol {0} timed out")]
    Timeout(String),

    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    #[error("server {0} is not part of the tree")]
    NotInTree(ServerId),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("session closed before the protocol finished")]
    SessionClosed,

    #[error("no protocol registered as {0}")]
    UnknownProtocol(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type OnetResult<T> = Result<T, OnetError>;
