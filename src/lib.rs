//! # capbus
//!
//! A local, capability-aware message bus. Peers attach to a bus endpoint
//! with HELLO, exchange typed datagrams addressed by unique ids or
//! registered well-known names, subscribe to broadcasts through
//! bloom-filtered match rules, and pass file handles and caller metadata
//! in-band. Delivered messages land in a per-connection shared-memory pool
//! that the consumer releases explicitly.
//!
//! ## Architecture
//!
//! ```text
//! user buffer ──▶ builder (validate, borrow handles, capture payload)
//!             ──▶ dispatcher (resolve name/id, policy gate, augment)
//!             ──▶ receiver queue ──▶ pool offset ──▶ FREE
//! ```
//!
//! The crate is synchronous: receivers block on a per-connection condition
//! variable, and every connection additionally exposes an eventfd that
//! stays readable while messages are queued, so integrators can drive RECV
//! from their own event loop.

pub mod bus;
pub mod config;
pub mod conn;
pub mod error;
pub mod handle;
pub mod handles;
pub mod match_db;
mod message;
pub mod names;
pub mod policy;
pub mod pool;
pub mod utils;
pub mod wire;

pub use bus::{Bus, Endpoint};
pub use config::BusConfig;
pub use conn::{ConnId, ConnRole, Connection, RecvResult};
pub use error::{Error, Result};
pub use handle::{
    FreeCmd, Handle, HelloCmd, HelloReply, InfoCmd, MakeCmd, MatchCmd, NameCmd, NameListCmd,
    OffsetReply, RecvCmd, SendCmd, SendReply, UpdateCmd,
};
pub use wire::{Creds, MsgAssembler, MsgHeader};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default limits; every value can be overridden per bus through
/// [`BusConfig`].
pub mod defaults {
    /// Broadcast bloom filter width in bytes.
    pub const BLOOM_SIZE: usize = 64;

    /// Upper bound for one message, header and items included.
    pub const MSG_MAX_SIZE: usize = 0x8000;

    /// Maximum number of items in one message.
    pub const MSG_MAX_ITEMS: usize = 128;

    /// Maximum number of external payload descriptors per message.
    pub const MSG_MAX_PAYLOAD_VECS: usize = 32;

    /// Aggregate bound over all external payload bytes of one message.
    pub const MSG_MAX_PAYLOAD_SIZE: usize = 0x0010_0000;

    /// Below this aggregate size, unaligned external payloads are inlined.
    pub const MSG_MAX_INLINE_SIZE: usize = 0x800;

    /// Maximum number of file handles attached to one message.
    pub const MSG_MAX_HANDLES: usize = 16;

    /// Per-connection cap on queued, undelivered messages.
    pub const CONN_MAX_MSGS: usize = 64;

    /// Per-connection cap on outstanding byte allocations.
    pub const CONN_MAX_ALLOCATED_BYTES: usize = 0x0010_0000;

    /// Upper bound for a per-connection receive pool.
    pub const POOL_MAX_SIZE: usize = 16 * 1024 * 1024;
}
