//! RPC scenarios between two real peers.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use engine_shared::{
    prelude::*,
    protocol::{self, EntityState},
};
use engine_tests::{init_tracing, never_within, wait_until};

/// A host and a client, connected, with the host's view of the client.
struct Session {
    host: RpcPeer,
    client: RpcPeer,
    on_host: Connection,
    on_client: Connection,
}

fn connect(mut host: RpcPeer, mut client: RpcPeer) -> anyhow::Result<Session> {
    host.start("127.0.0.1", 0, Role::Host)?;
    let port = host
        .peer()
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("host not bound"))?
        .port();
    client.start("127.0.0.1", port, Role::Client)?;
    wait_until("connection", || {
        host.connection_count() == 1 && client.connection_count() == 1
    })?;
    let on_host = host.connections().remove(0);
    let on_client = client.connections().remove(0);
    Ok(Session {
        host,
        client,
        on_host,
        on_client,
    })
}

fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let c = Rc::new(Cell::new(0));
    (Rc::clone(&c), c)
}

fn state(id: i64, name: &str, x: f64) -> EntityState {
    EntityState {
        id,
        name: name.to_string(),
        position: Vec3::new(x, x * 2.0, -x),
        rotation: Vec4::new(0.0, 0.0, 0.7071, 0.7071),
        alive: id != 2,
    }
}

#[test]
fn hash_is_fixed_by_name() {
    // SHA-256("foo") begins 2c 26 b4 6b.
    assert_eq!(procedure_hash("foo"), 0x2c26_b46b >> 1);
    assert_eq!(procedure_hash("foo"), procedure_hash(&String::from("foo")));
    assert_eq!(procedure_hash(protocol::SET_STATES), 0x61e1_1951);
}

#[test]
fn set_states_reaches_client_handler_once() -> anyhow::Result<()> {
    init_tracing();
    let host = RpcPeer::new(PeerConfig::default())?;
    let mut client = RpcPeer::new(PeerConfig::default())?;

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    client.register(
        protocol::SET_STATES,
        RunsOn::CLIENT,
        move |_, _, (states,): (Vec<EntityState>,)| sink.borrow_mut().push(states),
    )?;

    let mut s = connect(host, client)?;
    let states = vec![state(1, "a", 1.5), state(2, "b", -3.0), state(3, "ü", 0.0)];
    protocol::set_states().call(&s.on_host, (states.clone(),))?;

    wait_until("set_states handled", || {
        s.client.update(100);
        !received.borrow().is_empty()
    })?;
    never_within("second call", Duration::from_millis(100), || {
        s.client.update(100);
        received.borrow().len() > 1
    })?;
    assert_eq!(*received.borrow(), vec![states]);
    assert!(s.on_client.is_connected());
    Ok(())
}

#[test]
fn handlers_only_run_on_their_side() -> anyhow::Result<()> {
    init_tracing();
    let mut host = RpcPeer::new(PeerConfig::default())?;
    let mut client = RpcPeer::new(PeerConfig::default())?;

    let (host_only_on_client, seen1) = counter();
    let (client_only_on_host, seen2) = counter();
    let (host_pings, seen3) = counter();
    let (client_pings, seen4) = counter();

    client.register("host_cmd", RunsOn::HOST, move |_, _, (): ()| seen1.set(seen1.get() + 1))?;
    client.register("ping", RunsOn::ANY, move |_, _, (): ()| seen4.set(seen4.get() + 1))?;
    host.register("client_cmd", RunsOn::CLIENT, move |_, _, (): ()| seen2.set(seen2.get() + 1))?;
    host.register("ping", RunsOn::ANY, move |_, _, (): ()| seen3.set(seen3.get() + 1))?;

    let mut s = connect(host, client)?;
    assert!(s.host.is_hosting() && !s.client.is_hosting());

    let host_cmd = Procedure::<()>::new("host_cmd");
    let client_cmd = Procedure::<()>::new("client_cmd");
    let ping = Procedure::<()>::new("ping");

    host_cmd.call(&s.on_host, ())?;
    ping.call(&s.on_host, ())?;
    client_cmd.call(&s.on_client, ())?;
    ping.call(&s.on_client, ())?;

    wait_until("pings", || {
        s.host.update(100);
        s.client.update(100);
        host_pings.get() == 1 && client_pings.get() == 1
    })?;
    assert_eq!(host_only_on_client.get(), 0);
    assert_eq!(client_only_on_host.get(), 0);
    // Gated calls are not violations.
    assert!(s.on_host.is_connected() && s.on_client.is_connected());
    Ok(())
}

#[test]
fn list_over_bound_disconnects_sender() -> anyhow::Result<()> {
    init_tracing();
    let mut host = RpcPeer::new(PeerConfig::default().with_max_list_length(4))?;
    let client = RpcPeer::new(PeerConfig::default())?;
    let (calls, seen) = counter();
    host.register("nums", RunsOn::HOST, move |_, _, (_nums,): (Vec<i64>,)| seen.set(seen.get() + 1))?;

    let mut s = connect(host, client)?;
    let nums = Procedure::<(Vec<i64>,)>::new("nums");
    nums.call(&s.on_client, (vec![1, 2, 3, 4],))?;
    nums.call(&s.on_client, (vec![1, 2, 3, 4, 5],))?;

    wait_until("host drops client", || {
        s.host.update(100);
        s.host.connection_count() == 0
    })?;
    assert_eq!(calls.get(), 1);
    assert!(!s.on_host.is_connected());
    wait_until("client notices", || {
        s.client.update(100);
        s.client.connection_count() == 0
    })?;
    Ok(())
}

#[test]
fn unknown_procedure_disconnects_sender() -> anyhow::Result<()> {
    init_tracing();
    let host = RpcPeer::new(PeerConfig::default())?;
    let client = RpcPeer::new(PeerConfig::default())?;
    let mut s = connect(host, client)?;

    Procedure::<(i64,)>::new("nobody_registered_this").call(&s.on_client, (1,))?;
    wait_until("host drops client", || {
        s.host.update(100);
        s.host.connection_count() == 0
    })?;
    Ok(())
}

#[test]
fn truncated_header_disconnects_sender() -> anyhow::Result<()> {
    init_tracing();
    let host = RpcPeer::new(PeerConfig::default())?;
    let client = RpcPeer::new(PeerConfig::default())?;
    let mut s = connect(host, client)?;

    s.on_client.send(&[0x01, 0x02]);
    wait_until("host drops client", || {
        s.host.update(100);
        s.host.connection_count() == 0
    })?;
    Ok(())
}

#[test]
fn connect_hooks_run_newest_first() -> anyhow::Result<()> {
    init_tracing();
    let mut host = RpcPeer::new(PeerConfig::default())?;
    let client = RpcPeer::new(PeerConfig::default())?;
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in ["first", "second"] {
        let order = Rc::clone(&order);
        host.on_connect(RunsOn::HOST, move |_, _| order.borrow_mut().push(tag))?;
    }
    let skipped = Rc::clone(&order);
    host.on_connect(RunsOn::CLIENT, move |_, _| skipped.borrow_mut().push("client"))?;

    let mut s = connect(host, client)?;
    wait_until("hooks", || {
        s.host.update(100);
        order.borrow().len() >= 2
    })?;
    assert_eq!(*order.borrow(), vec!["second", "first"]);
    Ok(())
}
