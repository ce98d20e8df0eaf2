//! # Wire Format
//!
//! The byte-level layout shared by senders and receivers: a fixed message
//! header followed by a sequence of typed, 8-byte-aligned items. This module
//! owns parsing, validation-friendly iteration and composition of item
//! streams; it performs no I/O and holds no locks.
//!
//! ## Layout
//!
//! - Header: nine little-endian 64-bit fields (`size` covers header plus
//!   items, excluding nothing).
//! - Item: `size: u64` (header + payload, excluding padding), `kind: u64`,
//!   payload bytes, zero padding up to the next 8-byte boundary.
//! - Items with an empty payload are invalid; trailing bytes after the last
//!   item must be shorter than one alignment unit.

use crate::error::{Error, Result};
use crate::utils::align8;

/// Size of the fixed message header in bytes.
pub const MSG_HEADER_SIZE: usize = 72;
/// Size of an item header (size + kind) in bytes.
pub const ITEM_HEADER_SIZE: usize = 16;

/// Destination sentinel: resolve via a `DST_NAME` item.
pub const DST_ID_NAME: u64 = 0;
/// Destination sentinel: deliver to every matching connection.
pub const DST_ID_BROADCAST: u64 = u64::MAX;
/// Source id stamped on messages synthesized by the bus itself.
pub const SRC_ID_KERNEL: u64 = 0;
/// Lowest connection id ever handed out; stable for the bus lifetime.
pub const FIRST_CONN_ID: u64 = 1;

/// Message flag: the sender expects a reply carrying this cookie.
pub const MSG_EXPECT_REPLY: u64 = 1 << 0;
/// Message flag: fail instead of queueing on an activator.
pub const MSG_NO_AUTO_START: u64 = 1 << 1;
/// All message flags known to this implementation.
pub const MSG_FLAGS_ALL: u64 = MSG_EXPECT_REPLY | MSG_NO_AUTO_START;

/// Payload type of messages synthesized by the bus (notifications).
pub const PAYLOAD_KERNEL: u64 = 0;

/// External payload descriptor flag: address and size are page-aligned and
/// the payload must not be inlined.
pub const VEC_ALIGNED: u64 = 1;

// Item kinds carried by senders.
pub const ITEM_PAYLOAD: u64 = 1;
pub const ITEM_PAYLOAD_VEC: u64 = 2;
pub const ITEM_HANDLES: u64 = 3;
pub const ITEM_BLOOM: u64 = 4;
pub const ITEM_DST_NAME: u64 = 5;
pub const ITEM_NAME: u64 = 6;
pub const ITEM_POLICY_ACCESS: u64 = 7;
pub const ITEM_ATTACH_FLAGS: u64 = 8;
/// Introspection record in NAME_LIST blobs: owner id, flags, name.
pub const ITEM_NAME_ENTRY: u64 = 9;

// Match rule predicates.
pub const ITEM_MATCH_SRC_ID: u64 = 16;
pub const ITEM_MATCH_SRC_NAME: u64 = 17;
pub const ITEM_MATCH_DST_NAME: u64 = 18;
pub const ITEM_MATCH_PAYLOAD_TYPE: u64 = 19;

// Metadata items appended by the bus.
pub const ITEM_TIMESTAMP: u64 = 32;
pub const ITEM_CREDS: u64 = 33;
pub const ITEM_SRC_NAMES: u64 = 34;
pub const ITEM_COMM: u64 = 35;
pub const ITEM_EXE: u64 = 36;
pub const ITEM_CMDLINE: u64 = 37;
pub const ITEM_CAPS: u64 = 38;
pub const ITEM_CGROUP: u64 = 39;
pub const ITEM_AUDIT: u64 = 40;
pub const ITEM_SECLABEL: u64 = 41;

// Notification payloads (messages with `PAYLOAD_KERNEL`).
pub const ITEM_NAME_CHANGE: u64 = 64;
pub const ITEM_REPLY_DEAD: u64 = 65;

/// Longest accepted well-known name, excluding the NUL terminator.
pub const NAME_MAX_LEN: usize = 255;

#[inline]
fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Fixed message header preceding the item stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total size of header plus items as submitted by the sender; on
    /// delivery, rewritten to the size of the copied-out message.
    pub size: u64,
    pub flags: u64,
    pub dst_id: u64,
    pub src_id: u64,
    /// Opaque sender-chosen correlation value.
    pub cookie: u64,
    pub payload_type: u64,
    /// Cookie of the request this message replies to, 0 otherwise.
    pub cookie_reply: u64,
    /// Relative reply timeout; 0 means none.
    pub timeout_ns: u64,
    /// Dequeue priority; lower values are more urgent.
    pub priority: i64,
}

impl MsgHeader {
    /// Parse the fixed header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(Error::Invalid("buffer shorter than the message header"));
        }
        Ok(Self {
            size: get_u64(buf, 0),
            flags: get_u64(buf, 8),
            dst_id: get_u64(buf, 16),
            src_id: get_u64(buf, 24),
            cookie: get_u64(buf, 32),
            payload_type: get_u64(buf, 40),
            cookie_reply: get_u64(buf, 48),
            timeout_ns: get_u64(buf, 56),
            priority: get_u64(buf, 64) as i64,
        })
    }

    /// Serialize into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut out = [0u8; MSG_HEADER_SIZE];
        put_u64(&mut out, 0, self.size);
        put_u64(&mut out, 8, self.flags);
        put_u64(&mut out, 16, self.dst_id);
        put_u64(&mut out, 24, self.src_id);
        put_u64(&mut out, 32, self.cookie);
        put_u64(&mut out, 40, self.payload_type);
        put_u64(&mut out, 48, self.cookie_reply);
        put_u64(&mut out, 56, self.timeout_ns);
        put_u64(&mut out, 64, self.priority as u64);
        out
    }
}

/// Borrowed view of one item in an item stream.
#[derive(Debug, Clone, Copy)]
pub struct ItemView<'a> {
    pub kind: u64,
    /// Declared size including the item header, excluding padding.
    pub size: u64,
    pub payload: &'a [u8],
}

impl<'a> ItemView<'a> {
    /// Payload interpreted as a NUL-terminated string.
    pub fn as_str(&self) -> Result<&'a str> {
        item_str(self.payload)
    }
}

/// Iterator over a raw item stream.
///
/// Yields `Err` once and then stops if the stream is malformed; the caller
/// is expected to propagate the error. [`ItemIter::leftover`] reports the
/// number of unconsumed trailing bytes after iteration ends.
pub struct ItemIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Iterate over the item stream in `buf` (header already stripped).
pub fn items(buf: &[u8]) -> ItemIter<'_> {
    ItemIter {
        buf,
        pos: 0,
        failed: false,
    }
}

impl<'a> ItemIter<'a> {
    /// Trailing bytes that did not form a further item. Valid padding is
    /// shorter than one alignment unit; anything longer is a framing error
    /// the caller must reject.
    pub fn leftover(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = Result<ItemView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.len() - self.pos < ITEM_HEADER_SIZE {
            return None;
        }
        let remaining = self.buf.len() - self.pos;
        let size = get_u64(self.buf, self.pos);
        if size <= ITEM_HEADER_SIZE as u64 {
            self.failed = true;
            return Some(Err(Error::Invalid("item with empty payload")));
        }
        if size > remaining as u64 {
            self.failed = true;
            return Some(Err(Error::Invalid("item overruns its enclosing buffer")));
        }
        let size = size as usize;
        let kind = get_u64(self.buf, self.pos + 8);
        let payload = &self.buf[self.pos + ITEM_HEADER_SIZE..self.pos + size];
        self.pos += align8(size).min(remaining);
        Some(Ok(ItemView {
            kind,
            size: size as u64,
            payload,
        }))
    }
}

/// Append one item (header, payload, alignment padding) to `out`.
pub fn append_item(out: &mut Vec<u8>, kind: u64, payload: &[u8]) {
    let size = (ITEM_HEADER_SIZE + payload.len()) as u64;
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(payload);
    let padded = align8(payload.len());
    out.resize(out.len() + padded - payload.len(), 0);
}

/// Builder for complete wire messages, used by peers and tests to compose
/// the buffer handed to SEND.
#[derive(Debug, Default)]
pub struct MsgAssembler {
    header: MsgHeader,
    items: Vec<u8>,
}

impl MsgAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dst(mut self, dst_id: u64) -> Self {
        self.header.dst_id = dst_id;
        self
    }

    pub fn flags(mut self, flags: u64) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn cookie(mut self, cookie: u64) -> Self {
        self.header.cookie = cookie;
        self
    }

    pub fn cookie_reply(mut self, cookie: u64) -> Self {
        self.header.cookie_reply = cookie;
        self
    }

    pub fn payload_type(mut self, ty: u64) -> Self {
        self.header.payload_type = ty;
        self
    }

    pub fn timeout_ns(mut self, timeout: u64) -> Self {
        self.header.timeout_ns = timeout;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.header.priority = priority;
        self
    }

    /// Append an arbitrary item.
    pub fn item(mut self, kind: u64, payload: &[u8]) -> Self {
        append_item(&mut self.items, kind, payload);
        self
    }

    /// Append an inline payload item.
    pub fn payload(self, bytes: &[u8]) -> Self {
        self.item(ITEM_PAYLOAD, bytes)
    }

    /// Append an external payload descriptor.
    pub fn payload_vec(self, desc: VecDesc) -> Self {
        self.item(ITEM_PAYLOAD_VEC, &desc.to_bytes())
    }

    /// Append a handle array item.
    pub fn handles(self, fds: &[i32]) -> Self {
        let mut payload = Vec::with_capacity(fds.len() * 4);
        for fd in fds {
            payload.extend_from_slice(&fd.to_le_bytes());
        }
        self.item(ITEM_HANDLES, &payload)
    }

    /// Append a bloom filter item.
    pub fn bloom(self, bits: &[u8]) -> Self {
        self.item(ITEM_BLOOM, bits)
    }

    /// Append a destination name item (NUL terminator added here).
    pub fn dst_name(self, name: &str) -> Self {
        let mut payload = Vec::with_capacity(name.len() + 1);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        self.item(ITEM_DST_NAME, &payload)
    }

    /// Finish into the flat wire buffer.
    pub fn build(mut self) -> Vec<u8> {
        self.header.size = (MSG_HEADER_SIZE + self.items.len()) as u64;
        let mut out = Vec::with_capacity(self.header.size as usize);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.items);
        out
    }
}

/// External payload descriptor: a region in the sender's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VecDesc {
    pub address: u64,
    pub size: u64,
    pub flags: u64,
}

impl VecDesc {
    /// Exact payload size of a `PAYLOAD_VEC` item.
    pub const SIZE: usize = 24;

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != Self::SIZE {
            return Err(Error::Invalid("payload descriptor has the wrong size"));
        }
        Ok(Self {
            address: get_u64(payload, 0),
            size: get_u64(payload, 8),
            flags: get_u64(payload, 16),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_u64(&mut out, 0, self.address);
        put_u64(&mut out, 8, self.size);
        put_u64(&mut out, 16, self.flags);
        out
    }
}

/// Credential snapshot attached to delivered messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
}

impl Creds {
    /// Snapshot the calling task.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: std::process::id(),
            tid: unsafe { libc::gettid() } as u32,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 16 {
            return Err(Error::Invalid("credential item has the wrong size"));
        }
        let mut f = [0u32; 4];
        for (i, slot) in f.iter_mut().enumerate() {
            let mut b = [0u8; 4];
            b.copy_from_slice(&payload[i * 4..i * 4 + 4]);
            *slot = u32::from_le_bytes(b);
        }
        Ok(Self {
            uid: f[0],
            gid: f[1],
            pid: f[2],
            tid: f[3],
        })
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.uid.to_le_bytes());
        out[4..8].copy_from_slice(&self.gid.to_le_bytes());
        out[8..12].copy_from_slice(&self.pid.to_le_bytes());
        out[12..16].copy_from_slice(&self.tid.to_le_bytes());
        out
    }
}

/// Monotonic and wall-clock stamp taken when a message was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub monotonic_ns: u64,
    pub realtime_ns: u64,
}

impl Timestamp {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 16 {
            return Err(Error::Invalid("timestamp item has the wrong size"));
        }
        Ok(Self {
            monotonic_ns: get_u64(payload, 0),
            realtime_ns: get_u64(payload, 8),
        })
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        put_u64(&mut out, 0, self.monotonic_ns);
        put_u64(&mut out, 8, self.realtime_ns);
        out
    }
}

/// Payload of a `NAME_CHANGE` notification: ownership of `name` moved from
/// `old_id` to `new_id` (0 stands for "nobody").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub old_id: u64,
    pub new_id: u64,
    pub flags: u64,
    pub name: String,
}

impl NameChange {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 25 {
            return Err(Error::Invalid("name change item too short"));
        }
        Ok(Self {
            old_id: get_u64(payload, 0),
            new_id: get_u64(payload, 8),
            flags: get_u64(payload, 16),
            name: item_str(&payload[24..])?.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.name.len() + 1);
        out.extend_from_slice(&self.old_id.to_le_bytes());
        out.extend_from_slice(&self.new_id.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out
    }
}

/// Interpret an item payload as a NUL-terminated string: exactly one NUL,
/// at the end, valid UTF-8.
pub fn item_str(payload: &[u8]) -> Result<&str> {
    match payload.split_last() {
        Some((0, rest)) => {
            if rest.contains(&0) {
                return Err(Error::Invalid("embedded NUL in string item"));
            }
            std::str::from_utf8(rest).map_err(|_| Error::Invalid("string item is not UTF-8"))
        }
        _ => Err(Error::Invalid("string item is not NUL-terminated")),
    }
}

/// Syntactic check for well-known names: dot-separated non-empty elements,
/// at least two of them, element-initial characters non-numeric.
pub fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX_LEN || !name.contains('.') {
        return false;
    }
    for element in name.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return false;
        }
    }
    true
}

/// Whether every bit set in `mask` is also set in `bloom`.
pub fn bloom_contains(bloom: &[u8], mask: &[u8]) -> bool {
    bloom.len() == mask.len() && mask.iter().zip(bloom).all(|(m, b)| m & b == *m)
}
