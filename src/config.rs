//! # Bus Configuration
//!
//! Tunable limits for a bus instance. All fields default to the values in
//! [`crate::defaults`]; integrators can deserialize a partial override from
//! JSON or TOML thanks to `#[serde(default)]`.

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::utils;

/// Limits and parameters applied to every endpoint and connection of a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Width of broadcast bloom filters in bytes. Must be a non-zero
    /// multiple of 8; every broadcast and every bloom match mask on this
    /// bus carries exactly this many bytes.
    pub bloom_size: usize,

    /// Upper bound for a user message including header and items.
    pub max_msg_size: usize,

    /// Maximum number of items in one message.
    pub max_items: usize,

    /// Maximum number of external payload descriptors in one message.
    pub max_payload_vecs: usize,

    /// Aggregate byte bound over all external payload descriptors.
    pub max_payload_size: usize,

    /// Threshold below which unaligned external payloads are inlined.
    pub max_inline_size: usize,

    /// Maximum number of file handles attached to one message.
    pub max_handles: usize,

    /// Per-connection cap on queued (undelivered) messages.
    pub max_queued_msgs: usize,

    /// Per-connection cap on outstanding byte allocations charged for
    /// in-flight messages, staged payloads, handle tables and metadata.
    pub max_allocated_bytes: usize,

    /// Upper bound for the per-connection receive pool.
    pub max_pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bloom_size: defaults::BLOOM_SIZE,
            max_msg_size: defaults::MSG_MAX_SIZE,
            max_items: defaults::MSG_MAX_ITEMS,
            max_payload_vecs: defaults::MSG_MAX_PAYLOAD_VECS,
            max_payload_size: defaults::MSG_MAX_PAYLOAD_SIZE,
            max_inline_size: defaults::MSG_MAX_INLINE_SIZE,
            max_handles: defaults::MSG_MAX_HANDLES,
            max_queued_msgs: defaults::CONN_MAX_MSGS,
            max_allocated_bytes: defaults::CONN_MAX_ALLOCATED_BYTES,
            max_pool_size: defaults::POOL_MAX_SIZE,
        }
    }
}

impl BusConfig {
    /// Reject configurations the match engine or pool cannot operate on.
    pub fn validate(&self) -> Result<()> {
        if self.bloom_size == 0 || self.bloom_size % 8 != 0 {
            return Err(Error::Invalid("bloom size must be a non-zero multiple of 8"));
        }
        if self.max_msg_size < crate::wire::MSG_HEADER_SIZE {
            return Err(Error::Invalid("message size bound below header size"));
        }
        if self.max_pool_size < utils::page_size() {
            return Err(Error::Invalid("pool bound below one page"));
        }
        if self.max_inline_size > self.max_msg_size {
            return Err(Error::Invalid("inline threshold above message size bound"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BusConfig::default().validate().unwrap();
    }

    #[test]
    fn odd_bloom_width_is_rejected() {
        let cfg = BusConfig {
            bloom_size: 12,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn partial_override_deserializes_over_defaults() {
        let cfg: BusConfig = serde_json::from_str(r#"{"bloom_size": 128}"#).unwrap();
        assert_eq!(cfg.bloom_size, 128);
        assert_eq!(cfg.max_items, defaults::MSG_MAX_ITEMS);
        cfg.validate().unwrap();
    }
}
