//! # Error Taxonomy
//!
//! Every fallible bus operation returns [`Result`]. The variants map
//! one-to-one onto the failure kinds surfaced to peers; callers are expected
//! to branch on them, so the set is deliberately closed and each variant
//! states the precise condition that produced it. Anything not representable
//! here is a bug in the bus, not an error of the caller.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds reported to bus peers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed message buffer, item stream, padding or parameter block.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Message or item exceeds a hard size limit.
    #[error("message exceeds size limits")]
    TooBig,

    /// Too many items, payload vectors or handles in one message.
    #[error("too many items, payload vectors or handles")]
    TooMany,

    /// Broadcast messages must not carry file handles.
    #[error("broadcast messages cannot carry file handles")]
    HandlesOnBroadcast,

    /// Broadcast message without a bloom filter item.
    #[error("broadcast message lacks a bloom filter")]
    MissingBloom,

    /// Destination is the well-known-name sentinel but no name item was given.
    #[error("well-known-name destination lacks a destination name item")]
    MissingName,

    /// A destination name item was given together with a unique peer id.
    #[error("destination name given together with a unique id")]
    NameAndId,

    /// Not a syntactically valid bus name.
    #[error("not a valid bus name")]
    BadName,

    /// The per-connection outstanding byte allocation would be exceeded,
    /// or the receive pool has no room for the message.
    #[error("allocation quota exceeded")]
    QuotaExceeded,

    /// A passed file handle could not be borrowed.
    #[error("bad file handle")]
    BadHandle,

    /// Operation not allowed in the current handle or connection state
    /// (double HELLO, command after BYEBYE, wrong role).
    #[error("operation not allowed in the current state")]
    WrongState,

    /// The destination has reached its queued-message cap.
    #[error("receive queue of the destination is full")]
    QueueFull,

    /// No live connection for the requested id or name.
    #[error("no route to destination")]
    NoRoute,

    /// The name is owned by an activator and auto-start was suppressed.
    #[error("destination is not available")]
    NotAvailable,

    /// Denied by the endpoint policy or missing privilege.
    #[error("permission denied")]
    Denied,

    /// Non-blocking receive found the queue empty.
    #[error("no message ready")]
    WouldBlock,

    /// The receiver did not opt into accepting file handles.
    #[error("receiver does not accept file handles")]
    CannotPassHandles,

    /// A reply deadline expired before the reply arrived.
    #[error("reply deadline expired")]
    TimedOut,

    /// The connection, endpoint or bus went away while the operation was
    /// in flight.
    #[error("connection is gone")]
    Disconnected,

    /// The name is owned by another connection and was neither queued
    /// behind nor taken over.
    #[error("name is already owned")]
    AlreadyOwned,

    /// An OS resource backing the connection (shared-memory segment,
    /// readiness eventfd) could not be created.
    #[error("resource setup failed: {0}")]
    Resource(String),
}
