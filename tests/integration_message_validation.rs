//! Builder validation: every malformed message is rejected with its precise
//! error kind, and failed builds leave the quota untouched.

use std::sync::Arc;

use capbus::defaults::{MSG_MAX_ITEMS, MSG_MAX_SIZE};
use capbus::utils::page_size;
use capbus::wire::{self, MSG_HEADER_SIZE};
use capbus::{Bus, BusConfig, Error, Handle, HelloCmd, MsgAssembler, SendCmd};
use uuid::Uuid;

fn make_bus() -> Arc<Bus> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Bus::new(&format!("test-{}", Uuid::new_v4()), BusConfig::default()).unwrap()
}

fn hello(ep: &Arc<capbus::Endpoint>) -> Handle {
    let handle = Handle::open(ep);
    handle
        .hello(&mut HelloCmd {
            pool_size: page_size() * 16,
            ..Default::default()
        })
        .unwrap();
    handle
}

fn send_raw(handle: &Handle, msg: Vec<u8>) -> capbus::Result<capbus::SendReply> {
    handle.send(&mut SendCmd {
        msg,
        ..Default::default()
    })
}

#[test]
fn oversized_message_is_too_big() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .payload(&vec![0u8; MSG_MAX_SIZE])
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::TooBig)));
}

#[test]
fn item_count_limit_is_too_many() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let mut asm = MsgAssembler::new().dst(b.id().unwrap());
    for _ in 0..MSG_MAX_ITEMS + 1 {
        asm = asm.payload(b"x");
    }
    assert!(matches!(send_raw(&a, asm.build()), Err(Error::TooMany)));
}

#[test]
fn truncated_and_misdeclared_buffers_are_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    // shorter than a header
    assert!(matches!(
        send_raw(&a, vec![0u8; 16]),
        Err(Error::Invalid(_))
    ));

    // size field disagrees with the buffer
    let mut msg = MsgAssembler::new().dst(b.id().unwrap()).payload(b"x").build();
    msg.extend_from_slice(&[0u8; 16]);
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn excess_trailing_padding_is_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let mut msg = MsgAssembler::new().dst(b.id().unwrap()).payload(b"x").build();
    // eight zero bytes after the last item are no longer padding
    msg.extend_from_slice(&[0u8; 8]);
    let len = msg.len() as u64;
    msg[0..8].copy_from_slice(&len.to_le_bytes());
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn empty_items_are_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let mut msg = MsgAssembler::new().dst(b.id().unwrap()).build();
    msg.extend_from_slice(&(wire::ITEM_HEADER_SIZE as u64).to_le_bytes());
    msg.extend_from_slice(&wire::ITEM_PAYLOAD.to_le_bytes());
    let len = msg.len() as u64;
    msg[0..8].copy_from_slice(&len.to_le_bytes());
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn unknown_item_kinds_are_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .item(0x7777, b"mystery")
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn name_addressing_must_be_consistent() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    // name sentinel without a name item
    let msg = MsgAssembler::new().dst(wire::DST_ID_NAME).payload(b"x").build();
    assert!(matches!(send_raw(&a, msg), Err(Error::MissingName)));

    // unique id together with a name item
    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .dst_name("org.x")
        .payload(b"x")
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::NameAndId)));

    // syntactically broken destination name
    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_NAME)
        .dst_name("not a name")
        .payload(b"x")
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::BadName)));

    // valid name, but nobody owns it
    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_NAME)
        .dst_name("org.nobody")
        .payload(b"x")
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::NoRoute)));
}

#[test]
fn misaligned_marked_descriptor_is_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .payload_vec(wire::VecDesc {
            address: page_size() as u64 + 1,
            size: page_size() as u64,
            flags: wire::VEC_ALIGNED,
        })
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn duplicate_singleton_items_are_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);

    let bloom = vec![0u8; capbus::defaults::BLOOM_SIZE];
    let msg = MsgAssembler::new()
        .dst(wire::DST_ID_BROADCAST)
        .bloom(&bloom)
        .bloom(&bloom)
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn unknown_header_flags_are_invalid() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .flags(1 << 40)
        .payload(b"x")
        .build();
    assert!(matches!(send_raw(&a, msg), Err(Error::Invalid(_))));
}

#[test]
fn failed_builds_unwind_the_quota() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);
    let conn = a.connection().unwrap();
    let baseline = conn.allocated_bytes();

    // a build that fails after the message buffer was already charged
    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .payload(b"fine so far")
        .item(0x7777, b"then this")
        .build();
    assert!(send_raw(&a, msg).is_err());
    assert_eq!(conn.allocated_bytes(), baseline);

    // a successful send keeps the charge only while the message lives
    let msg = MsgAssembler::new().dst(b.id().unwrap()).payload(b"ok").build();
    send_raw(&a, msg).unwrap();
    assert!(conn.allocated_bytes() > baseline);

    let got = b
        .recv(&mut capbus::RecvCmd::default())
        .unwrap();
    b.free(&mut capbus::FreeCmd {
        offset: got.offset,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(conn.allocated_bytes(), baseline);
}

#[test]
fn round_trip_of_validated_items_revalidates() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let a = hello(&ep);
    let b = hello(&ep);

    let msg = MsgAssembler::new()
        .dst(b.id().unwrap())
        .cookie(3)
        .payload(b"one")
        .payload(&[0u8; 24])
        .payload(b"three")
        .build();
    send_raw(&a, msg.clone()).unwrap();

    // reserialize the parsed items and submit the result again
    let mut rebuilt = MsgAssembler::new().dst(b.id().unwrap()).cookie(4);
    for item in wire::items(&msg[MSG_HEADER_SIZE..]).flatten() {
        rebuilt = rebuilt.item(item.kind, item.payload);
    }
    send_raw(&a, rebuilt.build()).unwrap();
}
