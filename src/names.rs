//! # Name Registry
//!
//! Maps well-known names to their owning connection. Ownership transitions
//! (acquire, takeover, queued promotion, release, teardown) are atomic
//! against each other and against lookup; the synthetic name-change events
//! of a transition are enqueued to all observers inside the same critical
//! section, so a receiver acting on an event never observes a stale owner.
//!
//! Back-references from a name entry to its owner are weak and validated
//! under the registry lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::bus::Endpoint;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::match_db::MatchInput;
use crate::message::KMsg;
use crate::wire::{self, NameChange};

// NAME_ACQUIRE flags.
pub const NAME_ALLOW_REPLACEMENT: u64 = 1 << 0;
pub const NAME_REPLACE_EXISTING: u64 = 1 << 1;
pub const NAME_QUEUE: u64 = 1 << 2;
pub const NAME_FLAGS_ALL: u64 = NAME_ALLOW_REPLACEMENT | NAME_REPLACE_EXISTING | NAME_QUEUE;

// NAME_ACQUIRE return flags.
pub const NAME_IN_QUEUE: u64 = 1 << 3;
pub const NAME_ALREADY_OWNER: u64 = 1 << 4;

// NAME_LIST selector flags.
pub const NAME_LIST_UNIQUE: u64 = 1 << 0;
pub const NAME_LIST_NAMES: u64 = 1 << 1;
pub const NAME_LIST_ACTIVATORS: u64 = 1 << 2;
pub const NAME_LIST_QUEUED: u64 = 1 << 3;
pub const NAME_LIST_FLAGS_ALL: u64 =
    NAME_LIST_UNIQUE | NAME_LIST_NAMES | NAME_LIST_ACTIVATORS | NAME_LIST_QUEUED;

struct PendingClaim {
    conn: Weak<Connection>,
    id: u64,
    flags: u64,
}

struct NameEntry {
    owner: Weak<Connection>,
    owner_id: u64,
    /// Flags the current owner acquired with (`ALLOW_REPLACEMENT`).
    flags: u64,
    pending: VecDeque<PendingClaim>,
}

/// One row of a registry snapshot, input to NAME_LIST.
pub(crate) struct NameListing {
    pub name: String,
    pub owner_id: u64,
    pub flags: u64,
    pub activator: bool,
    pub queued: Vec<u64>,
}

/// The per-bus name store.
#[derive(Default)]
pub struct NameRegistry {
    entries: RwLock<HashMap<String, NameEntry>>,
}

/// Queue a name-change event to the transition parties and to every match
/// subscriber of the endpoint. Runs inside the registry critical section.
fn notify_name_change(
    ep: &Arc<Endpoint>,
    name: &str,
    flags: u64,
    old: Option<&Arc<Connection>>,
    new: Option<&Arc<Connection>>,
) {
    let ev = NameChange {
        old_id: old.map(|c| c.id()).unwrap_or(0),
        new_id: new.map(|c| c.id()).unwrap_or(0),
        flags,
        name: name.to_string(),
    };
    debug!(name, old = ev.old_id, new = ev.new_id, "name ownership changed");
    let payload = ev.to_bytes();

    // the parties of the transition always hear about it
    for conn in old.into_iter().chain(new) {
        let note = KMsg::notification(conn.id(), 0, wire::ITEM_NAME_CHANGE, &payload);
        let _ = conn.enqueue(note, Vec::new(), None, true);
    }

    let input = MatchInput {
        src_id: wire::SRC_ID_KERNEL,
        src_names: &[],
        dst_name: None,
        payload_type: wire::PAYLOAD_KERNEL,
        bloom: None,
    };
    for conn in ep.conns() {
        if conn.id() == ev.old_id || conn.id() == ev.new_id {
            continue;
        }
        if conn.is_monitor() || conn.match_db().lock().matches(&input) {
            let note = KMsg::notification(conn.id(), 0, wire::ITEM_NAME_CHANGE, &payload);
            let _ = conn.enqueue(note, Vec::new(), None, true);
        }
    }
}

/// Release a name currently owned by `conn`, promoting the head of the
/// pending queue if there is one. Must run under the registry write lock.
fn release_owned_locked(
    entries: &mut HashMap<String, NameEntry>,
    ep: &Arc<Endpoint>,
    conn: &Arc<Connection>,
    name: &str,
) {
    conn.remove_name(name);
    let (old, promoted) = {
        let entry = match entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        let old = entry.owner.upgrade();
        let promoted = loop {
            match entry.pending.pop_front() {
                None => break None,
                Some(claim) => {
                    if let Some(next) = claim.conn.upgrade() {
                        if next.active() {
                            break Some((next, claim.flags & NAME_ALLOW_REPLACEMENT));
                        }
                    }
                }
            }
        };
        if let Some((next, flags)) = &promoted {
            entry.owner = Arc::downgrade(next);
            entry.owner_id = next.id();
            entry.flags = *flags;
        }
        (old, promoted)
    };
    match promoted {
        Some((next, flags)) => {
            next.add_name(name);
            notify_name_change(ep, name, flags, old.as_ref(), Some(&next));
        }
        None => {
            entries.remove(name);
            notify_name_change(ep, name, 0, old.as_ref(), None);
        }
    }
}

impl NameRegistry {
    /// Claim `name` for `conn`. Returns acquire-state flags
    /// (`NAME_IN_QUEUE`, `NAME_ALREADY_OWNER`) on success.
    pub(crate) fn acquire(
        &self,
        ep: &Arc<Endpoint>,
        conn: &Arc<Connection>,
        name: &str,
        flags: u64,
    ) -> Result<u64> {
        if !wire::name_is_valid(name) {
            return Err(Error::BadName);
        }
        ep.check_own(conn.creds(), &conn.owned_names(), name)?;

        let mut entries = self.entries.write();
        let owner = entries
            .get(name)
            .and_then(|entry| entry.owner.upgrade().map(|c| (c, entry.flags)));
        match owner {
            None => {
                // unowned (or the owner died without cleanup): take it
                entries.insert(
                    name.to_string(),
                    NameEntry {
                        owner: Arc::downgrade(conn),
                        owner_id: conn.id(),
                        flags: flags & NAME_ALLOW_REPLACEMENT,
                        pending: VecDeque::new(),
                    },
                );
                conn.add_name(name);
                notify_name_change(ep, name, flags & NAME_ALLOW_REPLACEMENT, None, Some(conn));
                Ok(0)
            }
            Some((current, _)) if current.id() == conn.id() => {
                // re-acquire updates the replacement policy
                if let Some(entry) = entries.get_mut(name) {
                    entry.flags = flags & NAME_ALLOW_REPLACEMENT;
                }
                Ok(NAME_ALREADY_OWNER)
            }
            Some((current, entry_flags)) => {
                if entry_flags & NAME_ALLOW_REPLACEMENT != 0
                    && flags & NAME_REPLACE_EXISTING != 0
                {
                    // takeover: displace the current owner
                    current.remove_name(name);
                    conn.add_name(name);
                    if let Some(entry) = entries.get_mut(name) {
                        entry.owner = Arc::downgrade(conn);
                        entry.owner_id = conn.id();
                        entry.flags = flags & NAME_ALLOW_REPLACEMENT;
                    }
                    notify_name_change(
                        ep,
                        name,
                        flags & NAME_ALLOW_REPLACEMENT,
                        Some(&current),
                        Some(conn),
                    );
                    return Ok(0);
                }
                if flags & NAME_QUEUE != 0 {
                    if let Some(entry) = entries.get_mut(name) {
                        entry.pending.push_back(PendingClaim {
                            conn: Arc::downgrade(conn),
                            id: conn.id(),
                            flags,
                        });
                    }
                    return Ok(NAME_IN_QUEUE);
                }
                Err(Error::AlreadyOwned)
            }
        }
    }

    /// Give up `name`: as owner through the promotion path, as claimant by
    /// leaving the pending queue.
    pub(crate) fn release(
        &self,
        ep: &Arc<Endpoint>,
        conn: &Arc<Connection>,
        name: &str,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let is_owner = entries
            .get(name)
            .map(|entry| entry.owner_id == conn.id())
            .ok_or(Error::NoRoute)?;
        if is_owner {
            release_owned_locked(&mut entries, ep, conn, name);
            return Ok(());
        }
        let entry = match entries.get_mut(name) {
            Some(entry) => entry,
            None => return Err(Error::NoRoute),
        };
        let before = entry.pending.len();
        entry.pending.retain(|claim| claim.id != conn.id());
        if entry.pending.len() == before {
            return Err(Error::Denied);
        }
        Ok(())
    }

    /// Teardown path: drop every queued claim of `conn` and release each of
    /// its owned names through the promotion path.
    pub(crate) fn release_all(&self, ep: &Arc<Endpoint>, conn: &Arc<Connection>) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            entry.pending.retain(|claim| claim.id != conn.id());
        }
        let owned: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.owner_id == conn.id())
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            release_owned_locked(&mut entries, ep, conn, &name);
        }
    }

    /// Look up the live owner of `name`.
    pub(crate) fn resolve(&self, name: &str) -> Result<Arc<Connection>> {
        let entries = self.entries.read();
        let entry = entries.get(name).ok_or(Error::NoRoute)?;
        entry.owner.upgrade().ok_or(Error::NoRoute)
    }

    /// Stable snapshot for NAME_LIST, sorted by name.
    pub(crate) fn snapshot(&self) -> Vec<NameListing> {
        let entries = self.entries.read();
        let mut listing: Vec<NameListing> = entries
            .iter()
            .map(|(name, entry)| NameListing {
                name: name.clone(),
                owner_id: entry.owner_id,
                flags: entry.flags,
                activator: entry
                    .owner
                    .upgrade()
                    .map(|c| c.is_activator())
                    .unwrap_or(false),
                queued: entry.pending.iter().map(|claim| claim.id).collect(),
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        listing
    }
}
