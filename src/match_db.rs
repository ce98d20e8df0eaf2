//! # Match Engine
//!
//! Per-connection subscription rules deciding which broadcasts a connection
//! receives. A rule is a conjunction of predicates; a connection accepts a
//! broadcast when any of its rules matches. Monitors bypass this module
//! entirely.
//!
//! Rules are identified by a caller-chosen cookie; adding with `REPLACE`
//! first drops any rule carrying the same cookie.

use tracing::trace;

use crate::error::{Error, Result};
use crate::wire;

/// `MATCH_ADD` flag: drop any earlier rule with the same cookie first.
pub const MATCH_REPLACE: u64 = 1 << 0;

/// One subscription rule. Unset predicates match anything; `src_names`
/// matches when the sender owns *any* of the listed names.
#[derive(Debug, Clone, Default)]
pub struct MatchRule {
    pub cookie: u64,
    pub src_id: Option<u64>,
    pub src_names: Vec<String>,
    pub dst_name: Option<String>,
    pub payload_type: Option<u64>,
    /// Bloom mask; every set bit must also be set in the broadcast's bloom.
    pub bloom_mask: Option<Box<[u8]>>,
}

impl MatchRule {
    /// Build a rule from the item stream of a `MATCH_ADD` command.
    pub fn from_items(cookie: u64, items: &[u8], bloom_size: usize) -> Result<Self> {
        let mut rule = MatchRule {
            cookie,
            ..Default::default()
        };
        for item in wire::items(items) {
            let item = item?;
            match item.kind {
                wire::ITEM_MATCH_SRC_ID => {
                    if item.payload.len() != 8 {
                        return Err(Error::Invalid("source id predicate has the wrong size"));
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(item.payload);
                    rule.src_id = Some(u64::from_le_bytes(b));
                }
                wire::ITEM_MATCH_SRC_NAME => {
                    let name = item.as_str()?;
                    if !wire::name_is_valid(name) {
                        return Err(Error::BadName);
                    }
                    rule.src_names.push(name.to_string());
                }
                wire::ITEM_MATCH_DST_NAME => {
                    let name = item.as_str()?;
                    if !wire::name_is_valid(name) {
                        return Err(Error::BadName);
                    }
                    rule.dst_name = Some(name.to_string());
                }
                wire::ITEM_MATCH_PAYLOAD_TYPE => {
                    if item.payload.len() != 8 {
                        return Err(Error::Invalid("payload type predicate has the wrong size"));
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(item.payload);
                    rule.payload_type = Some(u64::from_le_bytes(b));
                }
                wire::ITEM_BLOOM => {
                    if item.payload.len() != bloom_size {
                        return Err(Error::Invalid("bloom mask width differs from the bus"));
                    }
                    rule.bloom_mask = Some(item.payload.to_vec().into_boxed_slice());
                }
                _ => return Err(Error::Invalid("unknown item in match rule")),
            }
        }
        Ok(rule)
    }

    fn matches(&self, input: &MatchInput<'_>) -> bool {
        if let Some(id) = self.src_id {
            if id != input.src_id {
                return false;
            }
        }
        if !self.src_names.is_empty()
            && !self
                .src_names
                .iter()
                .any(|n| input.src_names.iter().any(|s| s == n))
        {
            return false;
        }
        if let Some(name) = &self.dst_name {
            if input.dst_name != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(ty) = self.payload_type {
            if ty != input.payload_type {
                return false;
            }
        }
        if let Some(mask) = &self.bloom_mask {
            match input.bloom {
                Some(bloom) => {
                    if !wire::bloom_contains(bloom, mask) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// The broadcast-side view a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchInput<'a> {
    pub src_id: u64,
    pub src_names: &'a [String],
    pub dst_name: Option<&'a str>,
    pub payload_type: u64,
    pub bloom: Option<&'a [u8]>,
}

/// Rule database of one connection. Only the owning connection mutates it.
#[derive(Debug, Default)]
pub struct MatchDb {
    rules: Vec<MatchRule>,
}

impl MatchDb {
    /// Insert a rule; with `replace` any earlier rule of the same cookie is
    /// dropped first.
    pub fn add(&mut self, rule: MatchRule, replace: bool) {
        if replace {
            self.rules.retain(|r| r.cookie != rule.cookie);
        }
        trace!(cookie = rule.cookie, "match rule added");
        self.rules.push(rule);
    }

    /// Remove every rule registered under `cookie`.
    pub fn remove(&mut self, cookie: u64) -> Result<()> {
        let before = self.rules.len();
        self.rules.retain(|r| r.cookie != cookie);
        if self.rules.len() == before {
            return Err(Error::Invalid("unknown match rule cookie"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Whether any rule accepts the broadcast.
    pub fn matches(&self, input: &MatchInput<'_>) -> bool {
        self.rules.iter().any(|r| r.matches(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(bloom: Option<&'a [u8]>, names: &'a [String]) -> MatchInput<'a> {
        MatchInput {
            src_id: 7,
            src_names: names,
            dst_name: None,
            payload_type: 0x1000,
            bloom,
        }
    }

    #[test]
    fn empty_rule_matches_everything() {
        let mut db = MatchDb::default();
        db.add(MatchRule::default(), false);
        assert!(db.matches(&input(None, &[])));
    }

    #[test]
    fn bloom_mask_must_be_subset() {
        let mut db = MatchDb::default();
        db.add(
            MatchRule {
                cookie: 1,
                bloom_mask: Some(vec![0b0000_1001u8, 0].into_boxed_slice()),
                ..Default::default()
            },
            false,
        );
        let bloom = [0b0000_1101u8, 0b1000_0000];
        assert!(db.matches(&input(Some(&bloom), &[])));
        let other = [0b0000_0101u8, 0];
        assert!(!db.matches(&input(Some(&other), &[])));
        // rules with a mask never match bloom-less messages
        assert!(!db.matches(&input(None, &[])));
    }

    #[test]
    fn src_names_match_any_of_the_set() {
        let mut db = MatchDb::default();
        db.add(
            MatchRule {
                cookie: 2,
                src_names: vec!["org.a".into(), "org.b".into()],
                ..Default::default()
            },
            false,
        );
        let owned = vec!["org.b".to_string()];
        assert!(db.matches(&input(None, &owned)));
        let other = vec!["org.c".to_string()];
        assert!(!db.matches(&input(None, &other)));
    }

    #[test]
    fn replace_drops_rules_with_the_same_cookie() {
        let mut db = MatchDb::default();
        db.add(
            MatchRule {
                cookie: 5,
                src_id: Some(99),
                ..Default::default()
            },
            false,
        );
        assert!(!db.matches(&input(None, &[])));
        db.add(
            MatchRule {
                cookie: 5,
                ..Default::default()
            },
            true,
        );
        assert_eq!(db.len(), 1);
        assert!(db.matches(&input(None, &[])));
    }

    #[test]
    fn remove_unknown_cookie_fails() {
        let mut db = MatchDb::default();
        db.add(MatchRule::default(), false);
        assert!(db.remove(99).is_err());
        db.remove(0).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn rule_parses_from_items() {
        let mut items = Vec::new();
        wire::append_item(&mut items, wire::ITEM_MATCH_SRC_ID, &7u64.to_le_bytes());
        wire::append_item(&mut items, wire::ITEM_MATCH_SRC_NAME, b"org.a\0");
        wire::append_item(&mut items, wire::ITEM_BLOOM, &[0u8; 16]);
        let rule = MatchRule::from_items(3, &items, 16).unwrap();
        assert_eq!(rule.src_id, Some(7));
        assert_eq!(rule.src_names, vec!["org.a".to_string()]);
        assert!(rule.bloom_mask.is_some());

        let mut bad = Vec::new();
        wire::append_item(&mut bad, wire::ITEM_BLOOM, &[0u8; 8]);
        assert!(MatchRule::from_items(4, &bad, 16).is_err());
    }
}
