//! # Bus and Endpoint
//!
//! The bus is the process-wide root: it owns the name registry, the
//! connection table, the policy installed by policy holders and the bloom
//! width every broadcast on this bus must carry. Endpoints are the gates
//! peers attach through; a default endpoint inherits the bus policy while
//! custom endpoints carry their own.
//!
//! The send half of the dispatcher lives here: destination resolution,
//! policy gating, per-destination augmentation, sync-reply bookkeeping and
//! broadcast fan-out through the match engine. The receive half is the
//! queue side of [`crate::conn::Connection`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::config::BusConfig;
use crate::conn::{ConnId, Connection, QueueEntry, RecvResult, SEND_SYNC_REPLY};
use crate::error::{Error, Result};
use crate::match_db::MatchInput;
use crate::message::{build_dst_meta, KMsg};
use crate::names::NameRegistry;
use crate::policy::PolicyDb;
use crate::wire::{self, Creds};

static BUS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Top-level container for connections sharing one name space.
pub struct Bus {
    name: String,
    config: BusConfig,
    creator: Creds,
    pool_tag: String,
    conn_seq: AtomicU64,
    registry: NameRegistry,
    /// Bus-wide policy, installed by activators and policy holders.
    policy: RwLock<PolicyDb>,
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    default_ep: Mutex<Weak<Endpoint>>,
}

impl Bus {
    /// Create a live bus. The creator's identity is recorded; it decides
    /// which openers of default endpoints count as privileged.
    pub fn new(name: &str, config: BusConfig) -> Result<Arc<Bus>> {
        if name.is_empty() {
            return Err(Error::Invalid("empty bus name"));
        }
        config.validate()?;
        let seq = BUS_SEQ.fetch_add(1, Ordering::Relaxed);
        let bus = Arc::new(Bus {
            name: name.to_string(),
            config,
            creator: Creds::current(),
            pool_tag: format!("capbus_{}_{}", std::process::id(), seq),
            conn_seq: AtomicU64::new(wire::FIRST_CONN_ID),
            registry: NameRegistry::default(),
            policy: RwLock::new(PolicyDb::default()),
            connections: RwLock::new(HashMap::new()),
            default_ep: Mutex::new(Weak::new()),
        });
        debug!(name, "bus created");
        Ok(bus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Identity recorded at creation.
    pub fn creator(&self) -> &Creds {
        &self.creator
    }

    pub(crate) fn pool_tag(&self) -> &str {
        &self.pool_tag
    }

    pub(crate) fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub(crate) fn policy(&self) -> &RwLock<PolicyDb> {
        &self.policy
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_conn(&self, conn: &Arc<Connection>) {
        self.connections.write().insert(conn.id(), conn.clone());
    }

    pub(crate) fn forget_conn(&self, id: ConnId) {
        self.connections.write().remove(&id);
    }

    /// Resolve a peer by unique id; misses and inactive peers are no-route.
    pub(crate) fn find_conn(&self, id: ConnId) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .get(&id)
            .filter(|conn| conn.active())
            .cloned()
            .ok_or(Error::NoRoute)
    }

    pub(crate) fn all_conns(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// The bus's default endpoint, created on first use.
    pub fn default_endpoint(self: &Arc<Self>) -> Arc<Endpoint> {
        let mut slot = self.default_ep.lock();
        if let Some(ep) = slot.upgrade() {
            return ep;
        }
        let ep = Arc::new(Endpoint {
            bus: self.clone(),
            name: "bus".to_string(),
            policy: None,
            connections: RwLock::new(Vec::new()),
        });
        *slot = Arc::downgrade(&ep);
        ep
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("connections", &self.connections.read().len())
            .finish()
    }
}

/// A gate on a bus through which peers connect.
pub struct Endpoint {
    bus: Arc<Bus>,
    name: String,
    /// Custom endpoints gate sends with their own rules; `None` inherits
    /// the bus policy.
    policy: Option<RwLock<PolicyDb>>,
    connections: RwLock<Vec<Weak<Connection>>>,
}

impl Endpoint {
    /// Create a custom endpoint with its own policy rules. The caller is
    /// responsible for the privilege check.
    pub(crate) fn new_custom(bus: &Arc<Bus>, name: &str, policy_items: &[u8]) -> Result<Arc<Endpoint>> {
        if !wire::name_is_valid(name) {
            return Err(Error::BadName);
        }
        let mut db = PolicyDb::default();
        db.install_from_items(policy_items)?;
        debug!(name, "custom endpoint created");
        Ok(Arc::new(Endpoint {
            bus: bus.clone(),
            name: name.to_string(),
            policy: Some(RwLock::new(db)),
            connections: RwLock::new(Vec::new()),
        }))
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_custom(&self) -> bool {
        self.policy.is_some()
    }

    pub(crate) fn add_conn(&self, conn: &Arc<Connection>) {
        self.connections.write().push(Arc::downgrade(conn));
    }

    pub(crate) fn remove_conn(&self, conn: &Arc<Connection>) {
        self.connections
            .write()
            .retain(|w| w.upgrade().map(|c| c.id() != conn.id()).unwrap_or(false));
    }

    /// Live connections attached through this endpoint.
    pub(crate) fn conns(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// Replace the endpoint's own rule set (custom endpoints only).
    pub(crate) fn replace_policy(&self, items: &[u8]) -> Result<()> {
        let slot = self
            .policy
            .as_ref()
            .ok_or(Error::WrongState)?;
        let mut fresh = PolicyDb::default();
        fresh.install_from_items(items)?;
        *slot.write() = fresh;
        debug!(name = %self.name, "endpoint policy rewritten");
        Ok(())
    }

    /// Authorize `src` sending to `dst` under the effective policy.
    fn check_talk(&self, src: &Connection, dst: &Connection) -> Result<()> {
        let src_names = src.owned_names();
        let dst_names = dst.owned_names();
        match &self.policy {
            Some(policy) => policy
                .read()
                .check_talk(src.creds(), &src_names, &dst_names),
            None => self
                .bus
                .policy()
                .read()
                .check_talk(src.creds(), &src_names, &dst_names),
        }
    }

    /// Authorize acquisition of `name` under the effective policy.
    pub(crate) fn check_own(&self, creds: &Creds, src_names: &[String], name: &str) -> Result<()> {
        match &self.policy {
            Some(policy) => policy.read().check_own(creds, src_names, name),
            None => self.bus.policy().read().check_own(creds, src_names, name),
        }
    }

    /// The SEND path. Returns the delivered reply for sync sends.
    pub(crate) fn send(
        &self,
        src: &Arc<Connection>,
        kmsg: Arc<KMsg>,
        send_flags: u64,
    ) -> Result<Option<RecvResult>> {
        let hdr = kmsg.header.clone();
        let sync = send_flags & SEND_SYNC_REPLY != 0;

        if hdr.dst_id == wire::DST_ID_BROADCAST {
            if hdr.timeout_ns != 0 {
                return Err(Error::Invalid("broadcasts cannot carry a timeout"));
            }
            if sync {
                return Err(Error::Invalid("broadcasts cannot wait for a reply"));
            }
            self.broadcast(src, &kmsg);
            return Ok(None);
        }

        // resolve the destination
        let dst = if hdr.dst_id == wire::DST_ID_NAME {
            let name = kmsg.dst_name.as_deref().ok_or(Error::MissingName)?;
            let dst = self.bus.registry().resolve(name)?;
            if dst.is_activator() && hdr.flags & wire::MSG_NO_AUTO_START != 0 {
                return Err(Error::NotAvailable);
            }
            dst
        } else {
            self.bus.find_conn(hdr.dst_id)?
        };

        let deadline = (hdr.timeout_ns > 0).then(|| kmsg.ts_monotonic_ns + hdr.timeout_ns);

        // a reply to a pending sync request bypasses the policy gate and
        // wakes the waiter instead of being queued
        let mut kmsg = kmsg;
        if hdr.cookie_reply != 0 && dst.has_waiting_slot(src.id(), hdr.cookie_reply) {
            if kmsg.handles.is_some() && !dst.accepts_handles() {
                return Err(Error::CannotPassHandles);
            }
            let dst_meta = build_dst_meta(src, dst.attach_mask());
            let entry = QueueEntry {
                kmsg,
                dst_meta,
                deadline_ns: None,
            };
            match dst.try_complete_reply(src.id(), hdr.cookie_reply, entry) {
                Ok(()) => {
                    trace!(src = src.id(), dst = dst.id(), "sync reply delivered");
                    return Ok(None);
                }
                // the waiter gave up in the meantime; queue normally
                Err(entry) => kmsg = entry.kmsg,
            }
        }

        self.check_talk(src, &dst)?;
        let dst_meta = build_dst_meta(src, dst.attach_mask());

        if !sync {
            dst.enqueue(kmsg, dst_meta, deadline, false)?;
            return Ok(None);
        }

        // sync request: register the slot before the receiver can reply
        src.register_reply_slot(dst.id(), hdr.cookie);
        if let Err(err) = dst.enqueue(kmsg, dst_meta, deadline, false) {
            src.take_reply_slot(dst.id(), hdr.cookie);
            return Err(err);
        }
        match src.wait_reply(dst.id(), hdr.cookie, deadline) {
            Ok(entry) => {
                let reply = src.deliver_reply(&entry)?;
                Ok(Some(reply))
            }
            Err(Error::TimedOut) => {
                // reclaim the request if it is still queued and tell the
                // sender through its own queue as well
                dst.remove_queued(src.id(), hdr.cookie);
                let note = KMsg::notification(
                    src.id(),
                    hdr.cookie,
                    wire::ITEM_REPLY_DEAD,
                    &hdr.cookie.to_le_bytes(),
                );
                let _ = src.enqueue(note, Vec::new(), None, true);
                Err(Error::TimedOut)
            }
            Err(err) => Err(err),
        }
    }

    /// Fan a broadcast out to every matching active connection. Full
    /// queues count a drop; nothing here fails the sender.
    fn broadcast(&self, src: &Arc<Connection>, kmsg: &Arc<KMsg>) {
        let input = MatchInput {
            src_id: kmsg.header.src_id,
            src_names: &kmsg.src_names,
            dst_name: None,
            payload_type: kmsg.header.payload_type,
            bloom: kmsg.bloom.as_deref(),
        };
        let mut delivered = 0usize;
        for conn in self.conns() {
            if conn.id() == src.id() || !conn.active() {
                continue;
            }
            if !conn.is_monitor() && !conn.match_db().lock().matches(&input) {
                continue;
            }
            if conn.enqueue(kmsg.clone(), Vec::new(), None, true).is_ok() {
                delivered += 1;
            }
        }
        trace!(src = src.id(), delivered, "broadcast fanned out");
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("custom", &self.is_custom())
            .finish()
    }
}
