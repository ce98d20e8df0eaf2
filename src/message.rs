//! # Message Builder
//!
//! Turns a user-supplied wire buffer into a validated, self-contained
//! in-flight message. The builder runs three passes:
//!
//! 1. **Validation** — a single stateful traversal of the item stream
//!    enforcing size bounds, per-kind constraints and addressing
//!    consistency, with a precise error kind for every rejection.
//! 2. **Transformation** — external payload descriptors are captured into
//!    staged buffers (the sender may reuse its memory the moment SEND
//!    returns), handles are borrowed, the broadcast bloom is stored.
//! 3. **Augmentation** — the source id is stamped and a timestamp item,
//!    the sender's owned names and its credential snapshot are appended.
//!    Receiver-dependent metadata is computed later, per destination,
//!    against each receiver's attach mask.
//!
//! Every byte the message pins is charged against the source connection's
//! outstanding-allocation quota; a failed build unwinds all charges.

use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::conn::Connection;
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::handles::HandleTable;
use crate::pool::Pool;
use crate::utils::{self, align8, page_size};
use crate::wire::{self, MsgHeader, Timestamp, VecDesc, ITEM_HEADER_SIZE, MSG_HEADER_SIZE};

/// A validated message, shared by every queue that delivers it.
pub(crate) struct KMsg {
    pub header: MsgHeader,
    /// The item stream exactly as submitted (already validated).
    pub items: Vec<u8>,
    /// Captured bytes of each payload descriptor, in stream order.
    pub staged: Vec<Box<[u8]>>,
    /// Stored bloom filter of broadcast messages.
    pub bloom: Option<Box<[u8]>>,
    /// Destination name for well-known-name addressing.
    pub dst_name: Option<String>,
    /// Borrowed handles, released when the message dies undelivered.
    pub handles: Option<HandleTable>,
    /// Base metadata item stream: timestamp, source names, credentials.
    pub meta: Vec<u8>,
    /// Names the sender owned at build time; input to the match engine.
    pub src_names: Vec<String>,
    /// Monotonic half of the timestamp item; deadlines are relative to it.
    pub ts_monotonic_ns: u64,
    charged: usize,
    src: Weak<Connection>,
}

impl Drop for KMsg {
    fn drop(&mut self) {
        if self.charged > 0 {
            if let Some(src) = self.src.upgrade() {
                src.uncharge(self.charged);
            }
        }
    }
}

/// Charge `n` bytes to the source and remember the amount for unwind.
fn charge(kmsg: &mut KMsg, src: &Connection, n: usize) -> Result<()> {
    src.charge(n)?;
    kmsg.charged += n;
    Ok(())
}

/// Counters filled by the validation pass.
#[derive(Default)]
struct ScanState {
    n_items: usize,
    n_vecs: usize,
    vecs_size: usize,
    needs_vec: bool,
    fds: Option<Vec<RawFd>>,
    bloom: Option<Box<[u8]>>,
    dst_name: Option<String>,
}

fn scan_items(hdr: &MsgHeader, items: &[u8], cfg: &BusConfig) -> Result<ScanState> {
    let mut st = ScanState::default();
    let broadcast = hdr.dst_id == wire::DST_ID_BROADCAST;
    let mut iter = wire::items(items);
    for item in iter.by_ref() {
        let item = item?;
        st.n_items += 1;
        if st.n_items > cfg.max_items {
            return Err(Error::TooMany);
        }
        match item.kind {
            wire::ITEM_PAYLOAD => {}

            wire::ITEM_PAYLOAD_VEC => {
                let desc = VecDesc::parse(item.payload)?;
                st.n_vecs += 1;
                if st.n_vecs > cfg.max_payload_vecs {
                    return Err(Error::TooMany);
                }
                if desc.address == 0 || desc.size == 0 {
                    return Err(Error::Invalid("empty payload descriptor"));
                }
                if desc.flags & wire::VEC_ALIGNED != 0 {
                    let page = page_size() as u64;
                    if desc.address % page != 0 || desc.size % page != 0 {
                        return Err(Error::Invalid("descriptor marked aligned is not page-aligned"));
                    }
                    // aligned data is never inlined
                    st.needs_vec = true;
                }
                st.vecs_size += align8(desc.size as usize);
                if st.vecs_size > cfg.max_payload_size {
                    return Err(Error::TooBig);
                }
            }

            wire::ITEM_HANDLES => {
                if st.fds.is_some() {
                    return Err(Error::Invalid("more than one handle array"));
                }
                if broadcast {
                    return Err(Error::HandlesOnBroadcast);
                }
                if item.payload.len() % 4 != 0 {
                    return Err(Error::Invalid("handle array size is not a multiple of 4"));
                }
                let count = item.payload.len() / 4;
                if count > cfg.max_handles {
                    return Err(Error::TooMany);
                }
                let mut fds = Vec::with_capacity(count);
                for chunk in item.payload.chunks_exact(4) {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(chunk);
                    fds.push(i32::from_le_bytes(b));
                }
                st.fds = Some(fds);
            }

            wire::ITEM_BLOOM => {
                if st.bloom.is_some() {
                    return Err(Error::Invalid("more than one bloom filter"));
                }
                if !broadcast {
                    return Err(Error::Invalid("bloom filter on a directed message"));
                }
                if item.payload.len() != cfg.bloom_size
                    || !utils::is_aligned8(item.payload.len() as u64)
                {
                    return Err(Error::Invalid("bloom width differs from the bus"));
                }
                st.bloom = Some(item.payload.to_vec().into_boxed_slice());
            }

            wire::ITEM_DST_NAME => {
                if st.dst_name.is_some() {
                    return Err(Error::Invalid("more than one destination name"));
                }
                let name = item.as_str()?;
                if !wire::name_is_valid(name) {
                    return Err(Error::BadName);
                }
                st.dst_name = Some(name.to_string());
            }

            _ => return Err(Error::Invalid("unsupported item in message")),
        }
    }
    if iter.leftover() >= 8 {
        return Err(Error::Invalid("excess trailing padding"));
    }

    // addressing consistency
    if hdr.dst_id == wire::DST_ID_NAME && st.dst_name.is_none() {
        return Err(Error::MissingName);
    }
    if hdr.dst_id != wire::DST_ID_NAME && st.dst_name.is_some() {
        // covers broadcast as well: a name makes no sense there either
        return Err(Error::NameAndId);
    }
    if broadcast && st.bloom.is_none() {
        return Err(Error::MissingBloom);
    }
    Ok(st)
}

/// Capture the bytes behind an external payload descriptor.
///
/// The address is interpreted in the calling process, exactly like the
/// copy-from-user step of a kernel implementation; validity of the region
/// is the sender's contract.
fn capture_vec(desc: &VecDesc) -> Box<[u8]> {
    let slice =
        unsafe { std::slice::from_raw_parts(desc.address as usize as *const u8, desc.size as usize) };
    slice.to_vec().into_boxed_slice()
}

impl KMsg {
    /// Validate and take over a user message buffer submitted by `src`.
    pub(crate) fn from_user(src: &Arc<Connection>, buf: &[u8]) -> Result<Arc<KMsg>> {
        let cfg = src.limits();
        if buf.len() < MSG_HEADER_SIZE {
            return Err(Error::Invalid("buffer shorter than the message header"));
        }
        let mut header = MsgHeader::parse(buf)?;
        if header.size as usize != buf.len() {
            return Err(Error::Invalid("size field does not cover the buffer"));
        }
        if buf.len() > cfg.max_msg_size {
            return Err(Error::TooBig);
        }
        if header.flags & !wire::MSG_FLAGS_ALL != 0 {
            return Err(Error::Invalid("unknown message flags"));
        }

        let items = &buf[MSG_HEADER_SIZE..];
        let st = scan_items(&header, items, cfg)?;

        // sender id is assigned here, never taken from the caller
        header.src_id = src.id();

        let mut kmsg = KMsg {
            header,
            items: Vec::new(),
            staged: Vec::new(),
            bloom: st.bloom,
            dst_name: st.dst_name,
            handles: None,
            meta: Vec::new(),
            src_names: Vec::new(),
            ts_monotonic_ns: 0,
            charged: 0,
            src: Arc::downgrade(src),
        };

        charge(&mut kmsg, src, buf.len())?;
        kmsg.items = items.to_vec();

        // capture external payloads; aligned or large batches stay
        // descriptor-shaped until delivery, small unaligned ones are
        // logically inlined - either way the bytes are pinned now
        if st.n_vecs > 0 {
            let inline =
                !st.needs_vec && buf.len() + st.vecs_size < cfg.max_inline_size;
            charge(
                &mut kmsg,
                src,
                st.n_vecs * ITEM_HEADER_SIZE + st.vecs_size,
            )?;
            for item in wire::items(&kmsg.items).flatten() {
                if item.kind == wire::ITEM_PAYLOAD_VEC {
                    let desc = VecDesc::parse(item.payload)?;
                    kmsg.staged.push(capture_vec(&desc));
                }
            }
            trace!(
                vecs = st.n_vecs,
                bytes = st.vecs_size,
                inline,
                "captured external payload"
            );
        }

        // borrow the handle array
        if let Some(fds) = &st.fds {
            charge(&mut kmsg, src, ITEM_HEADER_SIZE + fds.len() * 8)?;
            kmsg.handles = Some(HandleTable::intern(fds)?);
        }

        kmsg.append_base_meta(src)?;
        Ok(Arc::new(kmsg))
    }

    /// Append the sender-independent metadata: timestamp, owned names and
    /// credential snapshot.
    fn append_base_meta(&mut self, src: &Arc<Connection>) -> Result<()> {
        let ts = Timestamp {
            monotonic_ns: utils::now_monotonic_ns(),
            realtime_ns: utils::now_realtime_ns(),
        };
        self.ts_monotonic_ns = ts.monotonic_ns;

        let names = src.owned_names();
        let mut meta = Vec::new();
        wire::append_item(&mut meta, wire::ITEM_TIMESTAMP, &ts.to_bytes());
        if !names.is_empty() {
            let mut payload = Vec::new();
            for name in &names {
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
            }
            wire::append_item(&mut meta, wire::ITEM_SRC_NAMES, &payload);
        }
        wire::append_item(&mut meta, wire::ITEM_CREDS, &src.creds().to_bytes());

        charge(self, src, meta.len())?;
        self.meta = meta;
        self.src_names = names;
        Ok(())
    }

    /// Build a bus-synthesized notification addressed to `dst_id`.
    pub(crate) fn notification(
        dst_id: u64,
        cookie_reply: u64,
        item_kind: u64,
        payload: &[u8],
    ) -> Arc<KMsg> {
        let mut items = Vec::new();
        wire::append_item(&mut items, item_kind, payload);
        let ts = Timestamp {
            monotonic_ns: utils::now_monotonic_ns(),
            realtime_ns: utils::now_realtime_ns(),
        };
        let mut meta = Vec::new();
        wire::append_item(&mut meta, wire::ITEM_TIMESTAMP, &ts.to_bytes());
        Arc::new(KMsg {
            header: MsgHeader {
                size: (MSG_HEADER_SIZE + items.len()) as u64,
                flags: 0,
                dst_id,
                src_id: wire::SRC_ID_KERNEL,
                cookie: 0,
                payload_type: wire::PAYLOAD_KERNEL,
                cookie_reply,
                timeout_ns: 0,
                priority: 0,
            },
            items,
            staged: Vec::new(),
            bloom: None,
            dst_name: None,
            handles: None,
            meta,
            src_names: Vec::new(),
            ts_monotonic_ns: ts.monotonic_ns,
            charged: 0,
            src: Weak::new(),
        })
    }

    /// The sending connection, while it is still alive.
    pub(crate) fn src_conn(&self) -> Option<Arc<Connection>> {
        self.src.upgrade()
    }

    /// Flatten the message for delivery: header, payload items in order
    /// (descriptors materialized and relabeled as inline payload), the
    /// installed handle array, then base and per-destination metadata.
    ///
    /// `installed_fds` carries the receiver-visible descriptor numbers and
    /// must match the handle count.
    pub(crate) fn build_delivery(&self, dst_meta: &[u8], installed_fds: &[RawFd]) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.items.len() + self.meta.len() + dst_meta.len());
        let mut stage = self.staged.iter();
        for item in wire::items(&self.items).flatten() {
            match item.kind {
                wire::ITEM_PAYLOAD => {
                    wire::append_item(&mut body, wire::ITEM_PAYLOAD, item.payload);
                }
                wire::ITEM_PAYLOAD_VEC => {
                    // order-preserving materialization
                    if let Some(bytes) = stage.next() {
                        wire::append_item(&mut body, wire::ITEM_PAYLOAD, bytes);
                    }
                }
                // sender-only items are not copied out
                _ => {}
            }
        }
        if self.handles.is_some() {
            let mut payload = Vec::with_capacity(installed_fds.len() * 4);
            for fd in installed_fds {
                payload.extend_from_slice(&fd.to_le_bytes());
            }
            wire::append_item(&mut body, wire::ITEM_HANDLES, &payload);
        }
        body.extend_from_slice(&self.meta);
        body.extend_from_slice(dst_meta);

        let mut header = self.header.clone();
        header.size = (MSG_HEADER_SIZE + body.len()) as u64;
        let mut out = Vec::with_capacity(header.size as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Write the flattened delivery into `pool`, returning offset and size.
    pub(crate) fn deliver_into(
        &self,
        pool: &Pool,
        dst_meta: &[u8],
        installed_fds: &[RawFd],
    ) -> Result<(usize, usize)> {
        let bytes = self.build_delivery(dst_meta, installed_fds);
        let offset = pool.reserve(bytes.len())?;
        if let Err(err) = pool.write(offset, 0, &bytes) {
            let _ = pool.release(offset);
            return Err(err);
        }
        Ok((offset, bytes.len()))
    }
}

/// Compose the receiver-dependent metadata items for one destination,
/// driven by the receiver's attach mask. Audit ids and the security label
/// come from the sender's HELLO snapshot, everything else reflects the
/// sending task at send time.
pub(crate) fn build_dst_meta(src: &Connection, attach: u64) -> Vec<u8> {
    use crate::conn::{
        ATTACH_AUDIT, ATTACH_CAPS, ATTACH_CGROUP, ATTACH_CMDLINE, ATTACH_COMM, ATTACH_EXE,
        ATTACH_SECLABEL,
    };

    let mut meta = Vec::new();
    if attach & ATTACH_COMM != 0 {
        let mut comm = utils::process_comm().into_bytes();
        comm.push(0);
        wire::append_item(&mut meta, wire::ITEM_COMM, &comm);
    }
    if attach & ATTACH_EXE != 0 {
        if let Some(exe) = utils::process_exe() {
            let mut exe = exe.into_bytes();
            exe.push(0);
            wire::append_item(&mut meta, wire::ITEM_EXE, &exe);
        }
    }
    if attach & ATTACH_CMDLINE != 0 {
        let cmdline = utils::process_cmdline();
        if !cmdline.is_empty() {
            wire::append_item(&mut meta, wire::ITEM_CMDLINE, &cmdline);
        }
    }
    if attach & ATTACH_CAPS != 0 {
        if let Some(caps) = utils::process_caps() {
            let mut payload = Vec::with_capacity(32);
            for set in caps {
                payload.extend_from_slice(&set.to_le_bytes());
            }
            wire::append_item(&mut meta, wire::ITEM_CAPS, &payload);
        }
    }
    if attach & ATTACH_CGROUP != 0 {
        if let Some(cgroup) = utils::process_cgroup() {
            let mut cgroup = cgroup.into_bytes();
            cgroup.push(0);
            wire::append_item(&mut meta, wire::ITEM_CGROUP, &cgroup);
        }
    }
    if attach & ATTACH_AUDIT != 0 {
        if let Some((session, loginuid)) = src.audit_ids() {
            let mut payload = [0u8; 8];
            payload[0..4].copy_from_slice(&session.to_le_bytes());
            payload[4..8].copy_from_slice(&loginuid.to_le_bytes());
            wire::append_item(&mut meta, wire::ITEM_AUDIT, &payload);
        }
    }
    if attach & ATTACH_SECLABEL != 0 {
        if let Some(label) = src.seclabel() {
            wire::append_item(&mut meta, wire::ITEM_SECLABEL, &label);
        }
    }
    meta
}
