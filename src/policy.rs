//! # Policy Gate
//!
//! Endpoint-level access rules. A rule grants a source, identified by uid,
//! gid, one of its owned names, or "anybody", the right to talk to (or own)
//! a destination name. A send is authorized when the destination owns no
//! governed name, or when at least one governed name has a grant matching
//! the source. Absence of a matching grant on a governed name is a denial.
//!
//! Policy holders install rules at HELLO; endpoint owners can rewrite the
//! rule set atomically.

use tracing::debug;

use crate::error::{Error, Result};
use crate::wire::{self, Creds};

/// Grant scope: the source uid must match `id`.
pub const POLICY_SCOPE_USER: u64 = 1;
/// Grant scope: the source gid must match `id`.
pub const POLICY_SCOPE_GROUP: u64 = 2;
/// Grant scope: any source.
pub const POLICY_SCOPE_WORLD: u64 = 3;
/// Grant scope: the source owns the name given in the rule.
pub const POLICY_SCOPE_SRC_NAME: u64 = 4;

/// Access level: may send unicast messages to the governed name.
pub const POLICY_TALK: u64 = 1;
/// Access level: may acquire the governed name (implies talk).
pub const POLICY_OWN: u64 = 2;

/// Identity a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    User(u32),
    Group(u32),
    World,
    /// The source currently owns this well-known name.
    Name(String),
}

/// One installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    /// The destination name this rule governs.
    pub dst_name: String,
    pub src: PolicySource,
    /// `POLICY_TALK` or `POLICY_OWN`; higher levels imply lower ones.
    pub level: u64,
}

impl PolicyRule {
    /// Parse a `POLICY_ACCESS` item payload: scope, id, level, governed
    /// name, and for the `SRC_NAME` scope a second, source name string.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 26 {
            return Err(Error::Invalid("policy access item too short"));
        }
        let mut f = [0u64; 3];
        for (i, slot) in f.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&payload[i * 8..i * 8 + 8]);
            *slot = u64::from_le_bytes(b);
        }
        let (scope, id, level) = (f[0], f[1], f[2]);
        if level != POLICY_TALK && level != POLICY_OWN {
            return Err(Error::Invalid("unknown policy access level"));
        }
        let mut strings = payload[24..].split_inclusive(|&b| b == 0);
        let dst_name = match strings.next() {
            Some(s) => wire::item_str(s)?.to_string(),
            None => return Err(Error::Invalid("policy access item lacks a name")),
        };
        if !wire::name_is_valid(&dst_name) {
            return Err(Error::BadName);
        }
        let src = match scope {
            POLICY_SCOPE_USER => PolicySource::User(id as u32),
            POLICY_SCOPE_GROUP => PolicySource::Group(id as u32),
            POLICY_SCOPE_WORLD => PolicySource::World,
            POLICY_SCOPE_SRC_NAME => {
                let name = match strings.next() {
                    Some(s) => wire::item_str(s)?.to_string(),
                    None => return Err(Error::Invalid("source-name rule lacks the source name")),
                };
                if !wire::name_is_valid(&name) {
                    return Err(Error::BadName);
                }
                PolicySource::Name(name)
            }
            _ => return Err(Error::Invalid("unknown policy access scope")),
        };
        Ok(Self {
            dst_name,
            src,
            level,
        })
    }

    /// Serialize back into a `POLICY_ACCESS` item payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (scope, id, src_name) = match &self.src {
            PolicySource::User(uid) => (POLICY_SCOPE_USER, *uid as u64, None),
            PolicySource::Group(gid) => (POLICY_SCOPE_GROUP, *gid as u64, None),
            PolicySource::World => (POLICY_SCOPE_WORLD, 0, None),
            PolicySource::Name(name) => (POLICY_SCOPE_SRC_NAME, 0, Some(name.as_str())),
        };
        let mut out = Vec::with_capacity(32 + self.dst_name.len());
        out.extend_from_slice(&scope.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&self.level.to_le_bytes());
        out.extend_from_slice(self.dst_name.as_bytes());
        out.push(0);
        if let Some(name) = src_name {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    fn matches_source(&self, creds: &Creds, src_names: &[String]) -> bool {
        match &self.src {
            PolicySource::User(uid) => creds.uid == *uid,
            PolicySource::Group(gid) => creds.gid == *gid,
            PolicySource::World => true,
            PolicySource::Name(name) => src_names.iter().any(|n| n == name),
        }
    }
}

/// Installed rule set of one endpoint (or of the bus, for default
/// endpoints).
#[derive(Debug, Default)]
pub struct PolicyDb {
    rules: Vec<PolicyRule>,
}

impl PolicyDb {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn install(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    /// Install every `POLICY_ACCESS` item found in `items`; other item
    /// kinds are left to the caller. Returns the number of rules added.
    pub fn install_from_items(&mut self, items: &[u8]) -> Result<usize> {
        let mut added = 0;
        for item in wire::items(items) {
            let item = item?;
            if item.kind == wire::ITEM_POLICY_ACCESS {
                self.install(PolicyRule::parse(item.payload)?);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Drop every installed rule; used by endpoint policy rewrite.
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    fn governed<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PolicyRule> {
        self.rules.iter().filter(move |r| r.dst_name == name)
    }

    /// Authorize a unicast from a source to a destination owning
    /// `dst_names`. Reply bypass is decided by the dispatcher, not here.
    pub fn check_talk(
        &self,
        creds: &Creds,
        src_names: &[String],
        dst_names: &[String],
    ) -> Result<()> {
        if self.rules.is_empty() {
            return Ok(());
        }
        let mut any_governed = false;
        for dst in dst_names {
            let mut rules = self.governed(dst).peekable();
            if rules.peek().is_some() {
                any_governed = true;
            }
            if rules.any(|r| r.level >= POLICY_TALK && r.matches_source(creds, src_names)) {
                return Ok(());
            }
        }
        if !any_governed {
            return Ok(());
        }
        debug!(uid = creds.uid, ?dst_names, "send denied by policy");
        Err(Error::Denied)
    }

    /// Authorize acquisition of `name`.
    pub fn check_own(&self, creds: &Creds, src_names: &[String], name: &str) -> Result<()> {
        let mut rules = self.governed(name).peekable();
        if rules.peek().is_none() {
            return Ok(());
        }
        if rules.any(|r| r.level >= POLICY_OWN && r.matches_source(creds, src_names)) {
            Ok(())
        } else {
            debug!(uid = creds.uid, name, "name acquisition denied by policy");
            Err(Error::Denied)
        }
    }
}
