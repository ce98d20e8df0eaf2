//! Broadcast fan-out: bloom subset matching, monitor delivery and the
//! dropped counter under queue overflow.

use std::sync::Arc;

use capbus::conn::{HELLO_MONITOR, RECV_DONT_BLOCK};
use capbus::defaults::{BLOOM_SIZE, CONN_MAX_MSGS};
use capbus::utils::page_size;
use capbus::wire::{self, MSG_HEADER_SIZE};
use capbus::{Bus, BusConfig, Error, Handle, HelloCmd, MatchCmd, MsgAssembler, RecvCmd, SendCmd};
use uuid::Uuid;

fn make_bus() -> Arc<Bus> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Bus::new(&format!("test-{}", Uuid::new_v4()), BusConfig::default()).unwrap()
}

fn hello_with(ep: &Arc<capbus::Endpoint>, flags: u64) -> Handle {
    let handle = Handle::open(ep);
    handle
        .hello(&mut HelloCmd {
            flags,
            pool_size: page_size() * 64,
            ..Default::default()
        })
        .unwrap();
    handle
}

fn bloom_with_bits(bits: &[usize]) -> Vec<u8> {
    let mut bloom = vec![0u8; BLOOM_SIZE];
    for &bit in bits {
        bloom[bit / 8] |= 1 << (bit % 8);
    }
    bloom
}

fn subscribe_bits(handle: &Handle, cookie: u64, bits: &[usize]) {
    let mut items = Vec::new();
    wire::append_item(&mut items, wire::ITEM_BLOOM, &bloom_with_bits(bits));
    handle
        .match_add(&mut MatchCmd {
            cookie,
            items,
            ..Default::default()
        })
        .unwrap();
}

fn broadcast_bits(handle: &Handle, bits: &[usize], payload: &[u8]) {
    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_BROADCAST)
        .bloom(&bloom_with_bits(bits))
        .payload(payload)
        .build();
    handle
        .send(&mut SendCmd {
            msg,
            ..Default::default()
        })
        .unwrap();
}

#[test]
fn bloom_subset_selects_receivers() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);
    let b = hello_with(&ep, 0);
    let d = hello_with(&ep, 0);

    subscribe_bits(&b, 1, &[3, 17]);
    subscribe_bits(&d, 1, &[3, 99]);

    broadcast_bits(&a, &[3, 17, 42], b"news");

    let got = b.recv(&mut RecvCmd::default()).unwrap();
    let buf = b.pool_read(got.offset, got.size).unwrap();
    let hdr = wire::MsgHeader::parse(&buf).unwrap();
    assert_eq!(hdr.src_id, a.id().unwrap());
    assert_eq!(hdr.dst_id, wire::DST_ID_BROADCAST);
    let payload = wire::items(&buf[MSG_HEADER_SIZE..])
        .flatten()
        .find(|item| item.kind == wire::ITEM_PAYLOAD)
        .expect("payload");
    assert_eq!(payload.payload, b"news");

    // bit 99 is not in the broadcast bloom: no delivery
    let err = d
        .recv(&mut RecvCmd {
            flags: RECV_DONT_BLOCK,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::WouldBlock));
}

#[test]
fn connection_without_rules_receives_nothing() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);
    let silent = hello_with(&ep, 0);

    broadcast_bits(&a, &[1, 2, 3], b"ignored");

    let err = silent
        .recv(&mut RecvCmd {
            flags: RECV_DONT_BLOCK,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::WouldBlock));
}

#[test]
fn monitor_receives_all_broadcasts_without_rules() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);
    let monitor = hello_with(&ep, HELLO_MONITOR);

    broadcast_bits(&a, &[5], b"observed");

    let got = monitor.recv(&mut RecvCmd::default()).unwrap();
    assert!(got.size > 0);
}

#[test]
fn sender_never_receives_its_own_broadcast() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);
    subscribe_bits(&a, 1, &[2]);

    broadcast_bits(&a, &[2], b"echo");
    let err = a
        .recv(&mut RecvCmd {
            flags: RECV_DONT_BLOCK,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::WouldBlock));
}

#[test]
fn overflowing_queue_counts_drops_instead_of_failing() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);
    let b = hello_with(&ep, 0);
    subscribe_bits(&b, 1, &[0]);

    let extra = 5;
    for i in 0..CONN_MAX_MSGS + extra {
        broadcast_bits(&a, &[0], &(i as u64).to_le_bytes());
    }

    let got = b.recv(&mut RecvCmd::default()).unwrap();
    assert_eq!(got.dropped, extra as u64);
    // the counter clears on read
    let got = b.recv(&mut RecvCmd::default()).unwrap();
    assert_eq!(got.dropped, 0);
}

#[test]
fn broadcast_requires_bloom_and_forbids_timeout() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);

    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_BROADCAST)
        .payload(b"x")
        .build();
    let err = a
        .send(&mut SendCmd {
            msg,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::MissingBloom));

    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_BROADCAST)
        .bloom(&bloom_with_bits(&[1]))
        .timeout_ns(1_000_000)
        .payload(b"x")
        .build();
    let err = a
        .send(&mut SendCmd {
            msg,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[test]
fn mismatched_bloom_width_is_rejected() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello_with(&ep, 0);

    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_BROADCAST)
        .bloom(&[0u8; 16])
        .payload(b"x")
        .build();
    let err = a
        .send(&mut SendCmd {
            msg,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}
