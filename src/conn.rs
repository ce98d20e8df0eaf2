//! # Connection
//!
//! Per-peer state: capability flags, the receive queue backed by the shared
//! pool, allocation quotas, owned names, match rules and pending sync-reply
//! slots. The lifecycle is a strict `NEW -> ACTIVE -> DISCONNECTING ->
//! DEAD` progression; every operation that touches the connection first
//! acquires it and fails once it left `ACTIVE`.
//!
//! ## Blocking model
//!
//! Receivers block on a per-connection condition variable; an eventfd is
//! kept armed while the queue is non-empty so integrators can compose the
//! connection with their own poll loop. Disconnection wakes every waiter
//! before draining outstanding acquisitions, so no operation can block a
//! teardown forever.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bus::Endpoint;
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::match_db::MatchDb;
use crate::message::KMsg;
use crate::pool::Pool;
use crate::utils::{self, page_size};
use crate::wire::{self, Creds};

/// Unique peer identifier on one bus.
pub type ConnId = u64;

// HELLO capability flags.
pub const HELLO_ACCEPT_HANDLES: u64 = 1 << 0;
pub const HELLO_ACTIVATOR: u64 = 1 << 1;
pub const HELLO_POLICY_HOLDER: u64 = 1 << 2;
pub const HELLO_MONITOR: u64 = 1 << 3;
pub const HELLO_FLAGS_ALL: u64 =
    HELLO_ACCEPT_HANDLES | HELLO_ACTIVATOR | HELLO_POLICY_HOLDER | HELLO_MONITOR;

// Attach mask: metadata kinds the receiver wants appended to every
// delivered message.
pub const ATTACH_COMM: u64 = 1 << 0;
pub const ATTACH_EXE: u64 = 1 << 1;
pub const ATTACH_CMDLINE: u64 = 1 << 2;
pub const ATTACH_CAPS: u64 = 1 << 3;
pub const ATTACH_CGROUP: u64 = 1 << 4;
pub const ATTACH_AUDIT: u64 = 1 << 5;
pub const ATTACH_SECLABEL: u64 = 1 << 6;
pub const ATTACH_ALL: u64 = ATTACH_COMM
    | ATTACH_EXE
    | ATTACH_CMDLINE
    | ATTACH_CAPS
    | ATTACH_CGROUP
    | ATTACH_AUDIT
    | ATTACH_SECLABEL;

// RECV mode flags.
pub const RECV_PEEK: u64 = 1 << 0;
pub const RECV_DROP: u64 = 1 << 1;
pub const RECV_USE_PRIORITY: u64 = 1 << 2;
pub const RECV_DONT_BLOCK: u64 = 1 << 3;
pub const RECV_FLAGS_ALL: u64 = RECV_PEEK | RECV_DROP | RECV_USE_PRIORITY | RECV_DONT_BLOCK;

// SEND flags.
pub const SEND_SYNC_REPLY: u64 = 1 << 0;
pub const SEND_FLAGS_ALL: u64 = SEND_SYNC_REPLY;

/// Role assigned at HELLO; role-gated commands check this tag explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Ordinary,
    /// Reserves a name and queues messages for a yet-to-start owner.
    Activator,
    /// Installs policy but does not transact.
    PolicyHolder,
    /// Receives every broadcast regardless of match rules.
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifeState {
    New,
    Active,
    Disconnecting,
    Dead,
}

struct Lifecycle {
    state: LifeState,
    acquired: usize,
}

/// One delivered-but-unread message on a receive queue.
pub(crate) struct QueueEntry {
    pub kmsg: Arc<KMsg>,
    /// Receiver-specific metadata computed against the attach mask.
    pub dst_meta: Vec<u8>,
    /// Absolute monotonic deadline of an expected reply, if any.
    pub deadline_ns: Option<u64>,
}

#[derive(Default)]
struct RecvQueue {
    entries: VecDeque<QueueEntry>,
    /// Broadcast deliveries refused because the queue was at its cap;
    /// surfaced to the consumer on the next read.
    dropped: u64,
}

enum SlotState {
    Waiting,
    Replied(Box<QueueEntry>),
    Gone,
}

struct ReplySlot {
    dst: ConnId,
    cookie: u64,
    state: SlotState,
}

/// Outcome of a successful RECV (or of a drop-mode RECV, with offset and
/// size zeroed).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvResult {
    /// Offset of the delivered message inside the connection's pool.
    pub offset: usize,
    /// Exact byte size of the delivered message.
    pub size: usize,
    /// Broadcasts lost to queue overflow since the previous read.
    pub dropped: u64,
    pub return_flags: u64,
}

fn make_eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(Error::Resource(format!(
            "eventfd: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// An attached peer of one endpoint.
pub struct Connection {
    id: ConnId,
    ep: Arc<Endpoint>,
    role: ConnRole,
    flags: u64,
    attach: AtomicU64,

    creds: Creds,
    comm: String,
    audit: Option<(u32, u32)>,
    seclabel: Option<Vec<u8>>,

    pool: Pool,
    ready: OwnedFd,

    active: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_cv: Condvar,

    queue: Mutex<RecvQueue>,
    queue_cv: Condvar,

    names: Mutex<Vec<String>>,
    match_db: Mutex<MatchDb>,
    allocated: Mutex<usize>,

    reply_slots: Mutex<Vec<ReplySlot>>,
    reply_cv: Condvar,
}

/// In-flight operation marker; teardown drains these before freeing state.
pub(crate) struct ConnGuard<'a> {
    conn: &'a Connection,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        let mut lc = self.conn.lifecycle.lock();
        lc.acquired -= 1;
        if lc.acquired == 0 {
            self.conn.lifecycle_cv.notify_all();
        }
    }
}

impl Connection {
    /// Create a connection attached through `ep`, registered with the bus
    /// but not yet `ACTIVE`; the caller activates it once HELLO-supplied
    /// names and policy are installed.
    pub(crate) fn connect(
        ep: &Arc<Endpoint>,
        flags: u64,
        attach: u64,
        pool_size: usize,
    ) -> Result<Arc<Connection>> {
        let role = match flags & (HELLO_ACTIVATOR | HELLO_POLICY_HOLDER | HELLO_MONITOR) {
            0 => ConnRole::Ordinary,
            HELLO_ACTIVATOR => ConnRole::Activator,
            HELLO_POLICY_HOLDER => ConnRole::PolicyHolder,
            HELLO_MONITOR => ConnRole::Monitor,
            _ => return Err(Error::Invalid("conflicting connection roles")),
        };
        if pool_size == 0 || pool_size % page_size() != 0 {
            return Err(Error::Invalid("pool size must be a non-zero page multiple"));
        }
        let bus = ep.bus();
        if pool_size > bus.config().max_pool_size {
            return Err(Error::TooBig);
        }

        let id = bus.next_conn_id();
        let pool = Pool::new(&format!("{}_{}", bus.pool_tag(), id), pool_size)?;
        let ready = make_eventfd()?;

        let conn = Arc::new(Connection {
            id,
            ep: ep.clone(),
            role,
            flags,
            attach: AtomicU64::new(attach & ATTACH_ALL),
            creds: Creds::current(),
            comm: utils::process_comm(),
            audit: utils::process_audit(),
            seclabel: utils::process_seclabel(),
            pool,
            ready,
            active: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                state: LifeState::New,
                acquired: 0,
            }),
            lifecycle_cv: Condvar::new(),
            queue: Mutex::new(RecvQueue::default()),
            queue_cv: Condvar::new(),
            names: Mutex::new(Vec::new()),
            match_db: Mutex::new(MatchDb::default()),
            allocated: Mutex::new(0),
            reply_slots: Mutex::new(Vec::new()),
            reply_cv: Condvar::new(),
        });
        bus.register_conn(&conn);
        ep.add_conn(&conn);
        debug!(id, ?role, pool_size, "connection created");
        Ok(conn)
    }

    /// `NEW -> ACTIVE`, after HELLO items were installed.
    pub(crate) fn activate(&self) {
        let mut lc = self.lifecycle.lock();
        if lc.state == LifeState::New {
            lc.state = LifeState::Active;
            self.active.store(true, Ordering::Release);
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }

    pub fn creds(&self) -> &Creds {
        &self.creds
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Pollable readiness signal: readable while the queue is non-empty.
    pub fn readiness(&self) -> BorrowedFd<'_> {
        self.ready.as_fd()
    }

    pub fn is_ordinary(&self) -> bool {
        self.role == ConnRole::Ordinary
    }

    pub fn is_activator(&self) -> bool {
        self.role == ConnRole::Activator
    }

    pub fn is_policy_holder(&self) -> bool {
        self.role == ConnRole::PolicyHolder
    }

    pub fn is_monitor(&self) -> bool {
        self.role == ConnRole::Monitor
    }

    pub fn accepts_handles(&self) -> bool {
        self.flags & HELLO_ACCEPT_HANDLES != 0
    }

    pub fn attach_mask(&self) -> u64 {
        self.attach.load(Ordering::Acquire)
    }

    pub(crate) fn set_attach_mask(&self, mask: u64) {
        self.attach.store(mask & ATTACH_ALL, Ordering::Release);
    }

    pub(crate) fn audit_ids(&self) -> Option<(u32, u32)> {
        self.audit
    }

    pub(crate) fn seclabel(&self) -> Option<Vec<u8>> {
        self.seclabel.clone()
    }

    pub(crate) fn comm(&self) -> &str {
        &self.comm
    }

    pub(crate) fn limits(&self) -> &BusConfig {
        self.ep.bus().config()
    }

    pub(crate) fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Pin the connection for the duration of one operation.
    pub(crate) fn acquire(&self) -> Result<ConnGuard<'_>> {
        let mut lc = self.lifecycle.lock();
        if lc.state != LifeState::Active {
            return Err(Error::WrongState);
        }
        lc.acquired += 1;
        Ok(ConnGuard { conn: self })
    }

    // ---- quota accounting -------------------------------------------------

    /// Charge `n` bytes against the outstanding-allocation quota.
    pub(crate) fn charge(&self, n: usize) -> Result<()> {
        let mut allocated = self.allocated.lock();
        if *allocated + n > self.limits().max_allocated_bytes {
            trace!(id = self.id, n, outstanding = *allocated, "quota exceeded");
            return Err(Error::QuotaExceeded);
        }
        *allocated += n;
        Ok(())
    }

    pub(crate) fn uncharge(&self, n: usize) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(n);
    }

    /// Bytes currently charged; quiesces to 0 when nothing is in flight.
    pub fn allocated_bytes(&self) -> usize {
        *self.allocated.lock()
    }

    // ---- owned names ------------------------------------------------------

    /// Snapshot of the currently owned names, in acquisition order.
    pub fn owned_names(&self) -> Vec<String> {
        self.names.lock().clone()
    }

    pub(crate) fn add_name(&self, name: &str) {
        self.names.lock().push(name.to_string());
    }

    pub(crate) fn remove_name(&self, name: &str) {
        self.names.lock().retain(|n| n != name);
    }

    pub(crate) fn match_db(&self) -> &Mutex<MatchDb> {
        &self.match_db
    }

    // ---- queue ------------------------------------------------------------

    fn arm_ready(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = unsafe { libc::write(self.ready.as_raw_fd(), one.as_ptr().cast(), 8) };
    }

    fn drain_ready(&self) {
        let mut buf = [0u8; 8];
        let _ = unsafe { libc::read(self.ready.as_raw_fd(), buf.as_mut_ptr().cast(), 8) };
    }

    /// Append a message to the receive queue. Broadcast deliveries bump the
    /// dropped counter instead of failing when the queue is at its cap.
    pub(crate) fn enqueue(
        &self,
        kmsg: Arc<KMsg>,
        dst_meta: Vec<u8>,
        deadline_ns: Option<u64>,
        broadcast: bool,
    ) -> Result<()> {
        if !self.active() {
            return Err(Error::NoRoute);
        }
        if kmsg.handles.is_some() && !self.accepts_handles() {
            return Err(Error::CannotPassHandles);
        }
        let mut q = self.queue.lock();
        if q.entries.len() >= self.limits().max_queued_msgs {
            if broadcast {
                q.dropped += 1;
                debug!(id = self.id, "receive queue full, broadcast dropped");
                return Ok(());
            }
            return Err(Error::QueueFull);
        }
        q.entries.push_back(QueueEntry {
            kmsg,
            dst_meta,
            deadline_ns,
        });
        self.queue_cv.notify_one();
        self.arm_ready();
        Ok(())
    }

    fn take_expired(q: &mut RecvQueue) -> Vec<QueueEntry> {
        if q.entries.iter().all(|e| e.deadline_ns.is_none()) {
            return Vec::new();
        }
        let now = utils::now_monotonic_ns();
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(q.entries.len());
        while let Some(entry) = q.entries.pop_front() {
            match entry.deadline_ns {
                Some(deadline) if deadline <= now => expired.push(entry),
                _ => keep.push_back(entry),
            }
        }
        q.entries = keep;
        expired
    }

    /// Report expired expected-reply messages back to their senders.
    fn notify_expired(&self, expired: Vec<QueueEntry>) {
        for entry in expired {
            let cookie = entry.kmsg.header.cookie;
            warn!(id = self.id, cookie, "expected reply expired undelivered");
            if let Some(src) = entry.kmsg.src_conn() {
                let note = KMsg::notification(
                    src.id(),
                    cookie,
                    wire::ITEM_REPLY_DEAD,
                    &cookie.to_le_bytes(),
                );
                let _ = src.enqueue(note, Vec::new(), None, true);
            }
        }
    }

    /// Remove a still-undelivered message by (source, cookie); used when a
    /// sync sender gives up on its deadline.
    pub(crate) fn remove_queued(&self, src_id: ConnId, cookie: u64) {
        let mut q = self.queue.lock();
        q.entries
            .retain(|e| !(e.kmsg.header.src_id == src_id && e.kmsg.header.cookie == cookie));
        if q.entries.is_empty() {
            self.drain_ready();
        }
    }

    /// Copy one entry into the pool, installing handles unless peeking.
    fn deliver_entry(&self, entry: &QueueEntry, peek: bool) -> Result<(usize, usize)> {
        let kmsg = &entry.kmsg;
        let (installed, raw): (Vec<OwnedFd>, Vec<RawFd>) = match (&kmsg.handles, peek) {
            (Some(table), false) => {
                let installed = table.install()?;
                let raw = installed.iter().map(|fd| fd.as_raw_fd()).collect();
                (installed, raw)
            }
            // peeking never installs handles; placeholders mark the slots
            (Some(table), true) => (Vec::new(), vec![-1; table.len()]),
            (None, _) => (Vec::new(), Vec::new()),
        };
        match kmsg.deliver_into(&self.pool, &entry.dst_meta, &raw) {
            Ok(ok) => {
                // receiver owns the installed descriptors from here on
                for fd in installed {
                    let _ = fd.into_raw_fd();
                }
                Ok(ok)
            }
            // dropping `installed` closes the partial set; the queue entry
            // is left untouched for a retry
            Err(err) => Err(err),
        }
    }

    /// The RECV path: select a head entry per mode, copy it out, return the
    /// pool offset. Blocks while the queue is empty unless `DONT_BLOCK`.
    pub(crate) fn recv(&self, flags: u64) -> Result<RecvResult> {
        let peek = flags & RECV_PEEK != 0;
        let drop_mode = flags & RECV_DROP != 0;
        let use_priority = flags & RECV_USE_PRIORITY != 0;
        let dont_block = flags & RECV_DONT_BLOCK != 0;
        if peek && drop_mode {
            return Err(Error::Invalid("peek and drop are mutually exclusive"));
        }

        let mut q = self.queue.lock();
        loop {
            let expired = Self::take_expired(&mut q);
            if !expired.is_empty() {
                drop(q);
                self.notify_expired(expired);
                q = self.queue.lock();
                continue;
            }
            if !q.entries.is_empty() {
                break;
            }
            if !self.active() {
                return Err(Error::Disconnected);
            }
            if dont_block {
                return Err(Error::WouldBlock);
            }
            self.queue_cv.wait(&mut q);
        }

        let mut idx = 0;
        if use_priority {
            for (i, entry) in q.entries.iter().enumerate() {
                if entry.kmsg.header.priority < q.entries[idx].kmsg.header.priority {
                    idx = i;
                }
            }
        }

        if drop_mode {
            let _ = q.entries.remove(idx);
            let dropped = std::mem::take(&mut q.dropped);
            if q.entries.is_empty() {
                self.drain_ready();
            }
            return Ok(RecvResult {
                offset: 0,
                size: 0,
                dropped,
                return_flags: flags,
            });
        }

        let (offset, size) = match q.entries.get(idx) {
            Some(entry) => self.deliver_entry(entry, peek)?,
            None => return Err(Error::WouldBlock),
        };
        if !peek {
            let _ = q.entries.remove(idx);
        }
        let dropped = std::mem::take(&mut q.dropped);
        if q.entries.is_empty() {
            self.drain_ready();
        }
        trace!(id = self.id, offset, size, "message delivered");
        Ok(RecvResult {
            offset,
            size,
            dropped,
            return_flags: flags,
        })
    }

    /// Deliver a sync reply straight into the pool, bypassing the queue.
    pub(crate) fn deliver_reply(&self, entry: &QueueEntry) -> Result<RecvResult> {
        let (offset, size) = self.deliver_entry(entry, false)?;
        Ok(RecvResult {
            offset,
            size,
            dropped: 0,
            return_flags: 0,
        })
    }

    /// Release a pool offset previously returned by RECV.
    pub(crate) fn free(&self, offset: usize) -> Result<()> {
        self.pool.release(offset)
    }

    // ---- sync-reply slots -------------------------------------------------

    pub(crate) fn register_reply_slot(&self, dst: ConnId, cookie: u64) {
        self.reply_slots.lock().push(ReplySlot {
            dst,
            cookie,
            state: SlotState::Waiting,
        });
    }

    pub(crate) fn take_reply_slot(&self, dst: ConnId, cookie: u64) {
        self.reply_slots
            .lock()
            .retain(|s| !(s.dst == dst && s.cookie == cookie));
    }

    /// Whether this connection is currently waiting for a reply from `dst`
    /// under `cookie`; replies matching a slot bypass the policy gate.
    pub(crate) fn has_waiting_slot(&self, dst: ConnId, cookie: u64) -> bool {
        self.reply_slots
            .lock()
            .iter()
            .any(|s| s.dst == dst && s.cookie == cookie && matches!(s.state, SlotState::Waiting))
    }

    /// Hand a reply directly to the waiting sender. Returns the entry back
    /// when the slot vanished in the meantime so the caller can queue it
    /// normally.
    pub(crate) fn try_complete_reply(
        &self,
        dst: ConnId,
        cookie: u64,
        entry: QueueEntry,
    ) -> std::result::Result<(), QueueEntry> {
        let mut slots = self.reply_slots.lock();
        for slot in slots.iter_mut() {
            if slot.dst == dst && slot.cookie == cookie && matches!(slot.state, SlotState::Waiting)
            {
                slot.state = SlotState::Replied(Box::new(entry));
                self.reply_cv.notify_all();
                return Ok(());
            }
        }
        Err(entry)
    }

    /// Block until the registered slot completes, the deadline passes or
    /// the connection goes away.
    pub(crate) fn wait_reply(
        &self,
        dst: ConnId,
        cookie: u64,
        deadline_ns: Option<u64>,
    ) -> Result<QueueEntry> {
        let mut slots = self.reply_slots.lock();
        loop {
            let idx = match slots
                .iter()
                .position(|s| s.dst == dst && s.cookie == cookie)
            {
                Some(idx) => idx,
                None => return Err(Error::Disconnected),
            };
            if !matches!(slots[idx].state, SlotState::Waiting) {
                let slot = slots.remove(idx);
                return match slot.state {
                    SlotState::Replied(entry) => Ok(*entry),
                    _ => Err(Error::Disconnected),
                };
            }
            if !self.active() {
                slots.remove(idx);
                return Err(Error::Disconnected);
            }
            match deadline_ns {
                Some(deadline) => {
                    let now = utils::now_monotonic_ns();
                    if now >= deadline {
                        slots.remove(idx);
                        return Err(Error::TimedOut);
                    }
                    let _ = self
                        .reply_cv
                        .wait_for(&mut slots, Duration::from_nanos(deadline - now));
                }
                None => self.reply_cv.wait(&mut slots),
            }
        }
    }

    /// Complete every slot waiting on `dst` with "gone"; returns the
    /// affected cookies so the caller can synthesize reply-dead events.
    pub(crate) fn fail_slots_to(&self, dst: ConnId) -> Vec<u64> {
        let mut slots = self.reply_slots.lock();
        let mut cookies = Vec::new();
        for slot in slots.iter_mut() {
            if slot.dst == dst && matches!(slot.state, SlotState::Waiting) {
                slot.state = SlotState::Gone;
                cookies.push(slot.cookie);
            }
        }
        if !cookies.is_empty() {
            self.reply_cv.notify_all();
        }
        cookies
    }

    // ---- teardown ---------------------------------------------------------

    /// `ACTIVE -> DISCONNECTING -> DEAD`. Wakes all waiters, drains
    /// acquisitions, releases names through the registry promotion path,
    /// completes foreign sync waits with reply-dead events and frees queued
    /// state. Callable exactly once; BYEBYE intentionally does not acquire
    /// the connection first.
    pub(crate) fn disconnect(self: &Arc<Self>) -> Result<()> {
        {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                LifeState::New | LifeState::Active => lc.state = LifeState::Disconnecting,
                _ => return Err(Error::WrongState),
            }
        }
        self.active.store(false, Ordering::Release);

        // wake blocked receivers and sync senders
        {
            let _q = self.queue.lock();
            self.queue_cv.notify_all();
        }
        {
            let mut slots = self.reply_slots.lock();
            for slot in slots.iter_mut() {
                if matches!(slot.state, SlotState::Waiting) {
                    slot.state = SlotState::Gone;
                }
            }
            self.reply_cv.notify_all();
        }

        // drain in-flight operations
        {
            let mut lc = self.lifecycle.lock();
            while lc.acquired > 0 {
                self.lifecycle_cv.wait(&mut lc);
            }
        }

        let bus = self.ep.bus().clone();
        bus.registry().release_all(&self.ep, self);
        self.ep.remove_conn(self);
        bus.forget_conn(self.id);

        // peers waiting for a reply from us will never get one
        for other in bus.all_conns() {
            for cookie in other.fail_slots_to(self.id) {
                let note = KMsg::notification(
                    other.id(),
                    cookie,
                    wire::ITEM_REPLY_DEAD,
                    &cookie.to_le_bytes(),
                );
                let _ = other.enqueue(note, Vec::new(), None, true);
            }
        }

        {
            let mut q = self.queue.lock();
            q.entries.clear();
        }
        self.match_db.lock().clear();

        {
            let mut lc = self.lifecycle.lock();
            lc.state = LifeState::Dead;
        }
        debug!(id = self.id, "connection disconnected");
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("active", &self.active())
            .finish()
    }
}
