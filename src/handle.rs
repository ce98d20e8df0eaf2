//! # Peer Command Surface
//!
//! The per-peer entry point for every bus command. A [`Handle`] mirrors the
//! state a kernel keeps per open file description: it starts idle, becomes
//! a connection after HELLO or an endpoint owner after ENDPOINT_MAKE, and
//! tears its connection down when dropped.
//!
//! Each command negotiates its flags (unknown bits are cleared and the
//! accepted set reported through `return_flags`), checks the role table and
//! pins the connection for the duration of the call. BYEBYE is the one
//! exception: it must not pin the connection it is about to drain.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bus::Endpoint;
use crate::conn::{
    Connection, RecvResult, ATTACH_ALL, HELLO_ACTIVATOR, HELLO_FLAGS_ALL, HELLO_MONITOR,
    HELLO_POLICY_HOLDER, RECV_FLAGS_ALL, SEND_FLAGS_ALL,
};
use crate::error::{Error, Result};
use crate::match_db::{MatchRule, MATCH_REPLACE};
use crate::message::KMsg;
use crate::names::{
    NAME_FLAGS_ALL, NAME_IN_QUEUE, NAME_LIST_ACTIVATORS, NAME_LIST_FLAGS_ALL, NAME_LIST_NAMES,
    NAME_LIST_QUEUED, NAME_LIST_UNIQUE,
};
use crate::policy::PolicyRule;
use crate::wire::{self, Creds};

/// Clear unknown flag bits and report the accepted set back to the caller.
fn negotiate(flags: u64, valid: u64, return_flags: &mut u64) -> u64 {
    *return_flags = flags & valid;
    flags & valid
}

/// HELLO parameter block.
#[derive(Debug, Clone, Default)]
pub struct HelloCmd {
    pub flags: u64,
    /// Metadata kinds to append to every message delivered to this peer.
    pub attach_flags: u64,
    /// Receive pool size; non-zero multiple of the page size.
    pub pool_size: usize,
    /// Optional items: activator `NAME`, `POLICY_ACCESS` rules.
    pub items: Vec<u8>,
    pub return_flags: u64,
}

/// HELLO result.
#[derive(Debug, Clone)]
pub struct HelloReply {
    pub id: u64,
    /// Bloom width every broadcast on this bus must carry.
    pub bloom_size: usize,
    pub pool_size: usize,
    /// Segment id under which the pool can be mapped.
    pub pool_os_id: String,
}

/// NAME_ACQUIRE / NAME_RELEASE parameter block.
#[derive(Debug, Clone, Default)]
pub struct NameCmd {
    pub flags: u64,
    pub name: String,
    pub return_flags: u64,
}

/// NAME_LIST parameter block.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameListCmd {
    pub flags: u64,
    pub return_flags: u64,
}

/// CONN_INFO / BUS_CREATOR_INFO parameter block; the target is either a
/// unique id or a well-known name.
#[derive(Debug, Clone, Default)]
pub struct InfoCmd {
    pub flags: u64,
    pub id: u64,
    pub name: Option<String>,
    pub return_flags: u64,
}

/// CONN_UPDATE / ENDPOINT_UPDATE parameter block.
#[derive(Debug, Clone, Default)]
pub struct UpdateCmd {
    pub flags: u64,
    pub items: Vec<u8>,
    pub return_flags: u64,
}

/// MATCH_ADD / MATCH_REMOVE parameter block.
#[derive(Debug, Clone, Default)]
pub struct MatchCmd {
    pub cookie: u64,
    pub flags: u64,
    pub items: Vec<u8>,
    pub return_flags: u64,
}

/// SEND parameter block carrying the composed wire message.
#[derive(Debug, Clone, Default)]
pub struct SendCmd {
    pub flags: u64,
    pub msg: Vec<u8>,
    pub return_flags: u64,
}

/// SEND result; `reply` is filled for sync sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendReply {
    pub reply: Option<RecvResult>,
}

/// RECV parameter block.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvCmd {
    pub flags: u64,
    pub return_flags: u64,
}

/// FREE parameter block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeCmd {
    pub flags: u64,
    pub offset: usize,
    pub return_flags: u64,
}

/// ENDPOINT_MAKE parameter block.
#[derive(Debug, Clone, Default)]
pub struct MakeCmd {
    pub name: String,
    pub flags: u64,
    /// Initial `POLICY_ACCESS` rules of the endpoint.
    pub items: Vec<u8>,
    pub return_flags: u64,
}

/// A blob composed into the caller's pool; released with FREE.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetReply {
    pub offset: usize,
    pub size: usize,
}

enum HandleState {
    Idle,
    Connected(Arc<Connection>),
    Owner(Arc<Endpoint>),
}

/// A peer's grip on an endpoint.
pub struct Handle {
    ep: Arc<Endpoint>,
    privileged: bool,
    state: Mutex<HandleState>,
}

impl Handle {
    /// Open a handle on an endpoint. The opener is privileged when the
    /// endpoint carries no custom policy and the caller is root or the bus
    /// creator.
    pub fn open(ep: &Arc<Endpoint>) -> Handle {
        let creds = Creds::current();
        let privileged =
            !ep.is_custom() && (creds.uid == 0 || creds.uid == ep.bus().creator().uid);
        Handle {
            ep: ep.clone(),
            privileged,
            state: Mutex::new(HandleState::Idle),
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn conn(&self) -> Result<Arc<Connection>> {
        match &*self.state.lock() {
            HandleState::Connected(conn) => Ok(conn.clone()),
            _ => Err(Error::WrongState),
        }
    }

    /// The connection behind this handle, for pool mapping and readiness
    /// polling.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.conn()
    }

    /// Unique id of the connection behind this handle.
    pub fn id(&self) -> Result<u64> {
        self.conn().map(|c| c.id())
    }

    /// Copy bytes out of the receive pool, for callers that do not map it.
    pub fn pool_read(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        self.conn()?.pool().read(offset, size)
    }

    fn install_hello_items(&self, conn: &Arc<Connection>, items: &[u8]) -> Result<()> {
        let mut reserve = None;
        for item in wire::items(items) {
            let item = item?;
            match item.kind {
                wire::ITEM_NAME => {
                    if reserve.is_some() {
                        return Err(Error::Invalid("more than one reserved name"));
                    }
                    reserve = Some(item.as_str()?.to_string());
                }
                wire::ITEM_POLICY_ACCESS => {
                    if !conn.is_activator() && !conn.is_policy_holder() {
                        return Err(Error::Denied);
                    }
                    let rule = PolicyRule::parse(item.payload)?;
                    self.ep.bus().policy().write().install(rule);
                }
                _ => return Err(Error::Invalid("unknown item in hello")),
            }
        }
        match (conn.is_activator(), reserve) {
            (true, Some(name)) => self
                .ep
                .bus()
                .registry()
                .acquire(&self.ep, conn, &name, 0)
                .map(|_| ()),
            (true, None) => Err(Error::Invalid("activator hello lacks a name")),
            (false, Some(_)) => Err(Error::Invalid("name reservation requires an activator")),
            (false, None) => Ok(()),
        }
    }

    /// Turn this handle into an active connection.
    pub fn hello(&self, cmd: &mut HelloCmd) -> Result<HelloReply> {
        if !matches!(*self.state.lock(), HandleState::Idle) {
            return Err(Error::WrongState);
        }
        let flags = negotiate(cmd.flags, HELLO_FLAGS_ALL, &mut cmd.return_flags);
        if flags & (HELLO_ACTIVATOR | HELLO_POLICY_HOLDER | HELLO_MONITOR) != 0
            && !self.privileged
        {
            return Err(Error::Denied);
        }

        let conn = Connection::connect(&self.ep, flags, cmd.attach_flags & ATTACH_ALL, cmd.pool_size)?;
        if let Err(err) = self.install_hello_items(&conn, &cmd.items) {
            let _ = conn.disconnect();
            return Err(err);
        }
        conn.activate();

        // protect against parallel commands on the same handle
        {
            let mut state = self.state.lock();
            if !matches!(*state, HandleState::Idle) {
                drop(state);
                let _ = conn.disconnect();
                return Err(Error::WrongState);
            }
            *state = HandleState::Connected(conn.clone());
        }
        debug!(id = conn.id(), "hello completed");
        Ok(HelloReply {
            id: conn.id(),
            bloom_size: self.ep.bus().config().bloom_size,
            pool_size: cmd.pool_size,
            pool_os_id: conn.pool().os_id().to_string(),
        })
    }

    /// Disconnect the connection behind this handle. Deliberately does not
    /// pin the connection: teardown waits for pinned operations to drain,
    /// and pinning here would deadlock against ourselves.
    pub fn byebye(&self) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        conn.disconnect()
    }

    /// Claim a well-known name.
    pub fn name_acquire(&self, cmd: &mut NameCmd) -> Result<u64> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        let flags = negotiate(cmd.flags, NAME_FLAGS_ALL, &mut cmd.return_flags);
        let state = self
            .ep
            .bus()
            .registry()
            .acquire(&self.ep, &conn, &cmd.name, flags)?;
        cmd.return_flags |= state;
        Ok(state)
    }

    /// Release a well-known name or leave its wait queue.
    pub fn name_release(&self, cmd: &mut NameCmd) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        self.ep.bus().registry().release(&self.ep, &conn, &cmd.name)
    }

    /// Compose the registry listing into the caller's pool.
    pub fn name_list(&self, cmd: &mut NameListCmd) -> Result<OffsetReply> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        let flags = negotiate(cmd.flags, NAME_LIST_FLAGS_ALL, &mut cmd.return_flags);

        let mut blob = Vec::new();
        if flags & NAME_LIST_UNIQUE != 0 {
            for peer in self.ep.bus().all_conns() {
                if !peer.active() {
                    continue;
                }
                let mut payload = Vec::with_capacity(17);
                payload.extend_from_slice(&peer.id().to_le_bytes());
                payload.extend_from_slice(&0u64.to_le_bytes());
                payload.push(0);
                wire::append_item(&mut blob, wire::ITEM_NAME_ENTRY, &payload);
            }
        }
        for row in self.ep.bus().registry().snapshot() {
            let listed = (flags & NAME_LIST_NAMES != 0 && !row.activator)
                || (flags & NAME_LIST_ACTIVATORS != 0 && row.activator);
            if listed {
                let mut payload = Vec::with_capacity(17 + row.name.len());
                payload.extend_from_slice(&row.owner_id.to_le_bytes());
                payload.extend_from_slice(&row.flags.to_le_bytes());
                payload.extend_from_slice(row.name.as_bytes());
                payload.push(0);
                wire::append_item(&mut blob, wire::ITEM_NAME_ENTRY, &payload);
            }
            if flags & NAME_LIST_QUEUED != 0 {
                for queued in &row.queued {
                    let mut payload = Vec::with_capacity(17 + row.name.len());
                    payload.extend_from_slice(&queued.to_le_bytes());
                    payload.extend_from_slice(&NAME_IN_QUEUE.to_le_bytes());
                    payload.extend_from_slice(row.name.as_bytes());
                    payload.push(0);
                    wire::append_item(&mut blob, wire::ITEM_NAME_ENTRY, &payload);
                }
            }
        }
        self.write_blob(&conn, blob)
    }

    fn write_blob(&self, conn: &Arc<Connection>, blob: Vec<u8>) -> Result<OffsetReply> {
        // an empty result still occupies a minimal slot the caller frees
        let size = blob.len().max(8);
        let offset = conn.pool().reserve(size)?;
        if let Err(err) = conn.pool().write(offset, 0, &blob) {
            let _ = conn.pool().release(offset);
            return Err(err);
        }
        Ok(OffsetReply {
            offset,
            size: blob.len(),
        })
    }

    fn info_blob(target: &Connection) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&target.id().to_le_bytes());
        blob.extend_from_slice(&target.attach_mask().to_le_bytes());
        wire::append_item(&mut blob, wire::ITEM_CREDS, &target.creds().to_bytes());
        let names = target.owned_names();
        if !names.is_empty() {
            let mut payload = Vec::new();
            for name in &names {
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
            }
            wire::append_item(&mut blob, wire::ITEM_SRC_NAMES, &payload);
        }
        let mut comm = target.comm().as_bytes().to_vec();
        comm.push(0);
        wire::append_item(&mut blob, wire::ITEM_COMM, &comm);
        blob
    }

    /// Introspect a peer by id or name; the blob lands in the caller's
    /// pool.
    pub fn conn_info(&self, cmd: &mut InfoCmd) -> Result<OffsetReply> {
        let conn = self.conn()?;
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        let target = match &cmd.name {
            Some(name) => {
                if !wire::name_is_valid(name) {
                    return Err(Error::BadName);
                }
                self.ep.bus().registry().resolve(name)?
            }
            None => self.ep.bus().find_conn(cmd.id)?,
        };
        let blob = Self::info_blob(&target);
        self.write_blob(&conn, blob)
    }

    /// Identity of whoever created the bus.
    pub fn bus_creator_info(&self, cmd: &mut InfoCmd) -> Result<OffsetReply> {
        let conn = self.conn()?;
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        let mut blob = Vec::new();
        blob.extend_from_slice(&0u64.to_le_bytes());
        blob.extend_from_slice(&0u64.to_le_bytes());
        wire::append_item(
            &mut blob,
            wire::ITEM_CREDS,
            &self.ep.bus().creator().to_bytes(),
        );
        self.write_blob(&conn, blob)
    }

    /// Change the attach mask; policy holders may also extend the bus
    /// policy.
    pub fn conn_update(&self, cmd: &mut UpdateCmd) -> Result<()> {
        let conn = self.conn()?;
        if conn.is_activator() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        for item in wire::items(&cmd.items) {
            let item = item?;
            match item.kind {
                wire::ITEM_ATTACH_FLAGS => {
                    if item.payload.len() != 8 {
                        return Err(Error::Invalid("attach flags item has the wrong size"));
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(item.payload);
                    conn.set_attach_mask(u64::from_le_bytes(b));
                }
                wire::ITEM_POLICY_ACCESS => {
                    if !conn.is_policy_holder() {
                        return Err(Error::Denied);
                    }
                    let rule = PolicyRule::parse(item.payload)?;
                    self.ep.bus().policy().write().install(rule);
                }
                _ => return Err(Error::Invalid("unknown item in update")),
            }
        }
        Ok(())
    }

    /// Subscribe to broadcasts.
    pub fn match_add(&self, cmd: &mut MatchCmd) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        let flags = negotiate(cmd.flags, MATCH_REPLACE, &mut cmd.return_flags);
        let rule = MatchRule::from_items(
            cmd.cookie,
            &cmd.items,
            self.ep.bus().config().bloom_size,
        )?;
        conn.match_db()
            .lock()
            .add(rule, flags & MATCH_REPLACE != 0);
        Ok(())
    }

    /// Drop the rules registered under a cookie.
    pub fn match_remove(&self, cmd: &mut MatchCmd) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        let result = conn.match_db().lock().remove(cmd.cookie);
        result
    }

    /// Submit a message; blocks for the reply when `SEND_SYNC_REPLY` is
    /// set.
    pub fn send(&self, cmd: &mut SendCmd) -> Result<SendReply> {
        let conn = self.conn()?;
        if !conn.is_ordinary() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        let flags = negotiate(cmd.flags, SEND_FLAGS_ALL, &mut cmd.return_flags);
        let kmsg = KMsg::from_user(&conn, &cmd.msg)?;
        let reply = self.ep.send(&conn, kmsg, flags)?;
        Ok(SendReply { reply })
    }

    /// Dequeue the next message into the pool.
    pub fn recv(&self, cmd: &mut RecvCmd) -> Result<RecvResult> {
        let conn = self.conn()?;
        if conn.is_policy_holder() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        let flags = negotiate(cmd.flags, RECV_FLAGS_ALL, &mut cmd.return_flags);
        conn.recv(flags)
    }

    /// Release a pool offset previously returned by RECV or an info
    /// command.
    pub fn free(&self, cmd: &mut FreeCmd) -> Result<()> {
        let conn = self.conn()?;
        if conn.is_policy_holder() {
            return Err(Error::WrongState);
        }
        let _guard = conn.acquire()?;
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        conn.free(cmd.offset)
    }

    /// Create a custom endpoint; the handle becomes its owner.
    pub fn endpoint_make(&self, cmd: &mut MakeCmd) -> Result<Arc<Endpoint>> {
        if !self.privileged {
            return Err(Error::Denied);
        }
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        let ep = Endpoint::new_custom(self.ep.bus(), &cmd.name, &cmd.items)?;
        let mut state = self.state.lock();
        if !matches!(*state, HandleState::Idle) {
            return Err(Error::WrongState);
        }
        *state = HandleState::Owner(ep.clone());
        Ok(ep)
    }

    /// Rewrite the policy of the owned endpoint.
    pub fn endpoint_update(&self, cmd: &mut UpdateCmd) -> Result<()> {
        let ep = match &*self.state.lock() {
            HandleState::Owner(ep) => ep.clone(),
            _ => return Err(Error::WrongState),
        };
        negotiate(cmd.flags, 0, &mut cmd.return_flags);
        ep.replace_policy(&cmd.items)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let HandleState::Connected(conn) = &*self.state.lock() {
            let _ = conn.disconnect();
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            HandleState::Idle => "idle",
            HandleState::Connected(_) => "connected",
            HandleState::Owner(_) => "endpoint-owner",
        };
        f.debug_struct("Handle")
            .field("state", &state)
            .field("privileged", &self.privileged)
            .finish()
    }
}
