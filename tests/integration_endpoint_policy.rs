//! Custom endpoints: creation through a privileged handle, per-endpoint
//! policy enforcement, policy rewrite and handle state transitions.

use std::sync::Arc;

use capbus::policy::{PolicyRule, PolicySource, POLICY_OWN};
use capbus::utils::page_size;
use capbus::wire;
use capbus::{
    Bus, BusConfig, Error, Handle, HelloCmd, MakeCmd, MsgAssembler, NameCmd, SendCmd, UpdateCmd,
};
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

fn badge_rule() -> Vec<u8> {
    let rule = PolicyRule {
        dst_name: "org.locked".into(),
        src: PolicySource::Name("org.badge".into()),
        level: POLICY_OWN,
    };
    let mut items = Vec::new();
    wire::append_item(&mut items, wire::ITEM_POLICY_ACCESS, &rule.to_bytes());
    items
}

#[test]
fn custom_endpoint_enforces_and_rewrites_its_policy() {
    let bus = make_bus();
    let ep = bus.default_endpoint();

    let maker = Handle::open(&ep);
    assert!(maker.is_privileged());
    let custom = maker
        .endpoint_make(&mut MakeCmd {
            name: "org.restricted".into(),
            items: badge_rule(),
            ..Default::default()
        })
        .unwrap();

    let a = hello(&custom);
    let b = hello(&custom);

    // ownership of the governed name needs the badge
    let err = a
        .name_acquire(&mut NameCmd {
            name: "org.locked".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Denied));
    a.name_acquire(&mut NameCmd {
        name: "org.badge".into(),
        ..Default::default()
    })
    .unwrap();
    a.name_acquire(&mut NameCmd {
        name: "org.locked".into(),
        ..Default::default()
    })
    .unwrap();

    // the badge-less peer may not talk to the governed owner
    let msg = MsgAssembler::new().dst(a.id().unwrap()).payload(b"hi").build();
    let err = b
        .send(&mut SendCmd {
            msg: msg.clone(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Denied));

    // the endpoint owner rewrites the policy to an empty rule set
    maker.endpoint_update(&mut UpdateCmd::default()).unwrap();
    b.send(&mut SendCmd {
        msg,
        ..Default::default()
    })
    .unwrap();
}

#[test]
fn custom_endpoint_handles_are_unprivileged() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let maker = Handle::open(&ep);
    let custom = maker
        .endpoint_make(&mut MakeCmd {
            name: "org.other".into(),
            ..Default::default()
        })
        .unwrap();

    let opener = Handle::open(&custom);
    assert!(!opener.is_privileged());
    let err = opener
        .endpoint_make(&mut MakeCmd {
            name: "org.nested".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Denied));
}

#[test]
fn handle_state_transitions_are_exclusive() {
    let bus = make_bus();
    let ep = bus.default_endpoint();

    // HELLO twice on the same handle
    let h = Handle::open(&ep);
    h.hello(&mut HelloCmd {
        pool_size: page_size() * 16,
        ..Default::default()
    })
    .unwrap();
    let err = h
        .hello(&mut HelloCmd {
            pool_size: page_size() * 16,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::WrongState));

    // a connected handle cannot become an endpoint owner
    let err = h
        .endpoint_make(&mut MakeCmd {
            name: "org.late".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::WrongState));

    // commands before HELLO report the wrong state
    let idle = Handle::open(&ep);
    let err = idle.recv(&mut capbus::RecvCmd::default()).unwrap_err();
    assert!(matches!(err, Error::WrongState));
}

#[test]
fn hello_validates_the_pool_size() {
    let bus = make_bus();
    let ep = bus.default_endpoint();

    let h = Handle::open(&ep);
    let err = h
        .hello(&mut HelloCmd {
            pool_size: 0,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    let err = h
        .hello(&mut HelloCmd {
            pool_size: page_size() + 1,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    // the handle stays usable after a rejected HELLO
    h.hello(&mut HelloCmd {
        pool_size: page_size(),
        ..Default::default()
    })
    .unwrap();
}

#[test]
fn unknown_hello_flags_are_cleared_and_reported() {
    let bus = make_bus();
    let ep = bus.default_endpoint();
    let h = Handle::open(&ep);
    let mut cmd = HelloCmd {
        flags: capbus::conn::HELLO_ACCEPT_HANDLES | (1 << 50),
        pool_size: page_size() * 16,
        ..Default::default()
    };
    h.hello(&mut cmd).unwrap();
    assert_eq!(cmd.return_flags, capbus::conn::HELLO_ACCEPT_HANDLES);
}
