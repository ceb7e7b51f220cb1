//! Raw peer behaviour over loopback sockets: framing, disconnect, send
//! backpressure and idle timeout.

use std::{cell::RefCell, io::Read, net::TcpStream, rc::Rc, time::Duration};

use bytes::Bytes;
use engine_shared::{
    config::PeerConfig,
    connection::{Connection, SEND_QUEUE_FRAMES},
    event::PeerEvent,
    frame::MAX_PAYLOAD,
    peer::{Peer, Role},
};
use engine_tests::{host_ephemeral, init_tracing, never_within, wait_until};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn connected_pair(host_config: PeerConfig) -> anyhow::Result<(Peer, Peer)> {
    let mut host = Peer::new(host_config)?;
    let port = host_ephemeral(&mut host)?;
    let mut client = Peer::new(PeerConfig::default())?;
    client.start("127.0.0.1", port, Role::Client)?;
    wait_until("both sides connected", || {
        host.connection_count() == 1 && client.connection_count() == 1
    })?;
    Ok((host, client))
}

fn random_payload(rng: &mut StdRng, len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    Bytes::from(buf)
}

#[test]
fn every_payload_size_arrives_as_one_data_event() -> anyhow::Result<()> {
    init_tracing();
    let (mut host, client) = connected_pair(PeerConfig::default())?;
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    host.set_on_data(move |_, payload, _| sink.borrow_mut().push(payload));

    let mut rng = StdRng::seed_from_u64(11);
    let mut sizes = vec![0, 1, 2, 3, 255, 256, 4096, MAX_PAYLOAD - 1, MAX_PAYLOAD];
    sizes.extend((0..20).map(|_| rng.gen_range(0..=MAX_PAYLOAD)));
    let sent: Vec<Bytes> = sizes.iter().map(|&n| random_payload(&mut rng, n)).collect();

    let server = client.connections().remove(0);
    for payload in &sent {
        client.send(&server, payload);
    }

    wait_until("all payloads", || {
        host.update(100);
        received.borrow().len() >= sent.len()
    })?;
    assert_eq!(*received.borrow(), sent);
    Ok(())
}

#[test]
fn oversized_payload_is_dropped_not_truncated() -> anyhow::Result<()> {
    init_tracing();
    let (mut host, client) = connected_pair(PeerConfig::default())?;
    let server = client.connections().remove(0);
    server.send(&vec![7u8; MAX_PAYLOAD + 1]);
    server.send(b"after");

    let mut seen = Vec::new();
    wait_until("follow-up payload", || {
        for event in host.poll_events(100) {
            if let PeerEvent::Data { payload, .. } = event {
                seen.push(payload);
            }
        }
        !seen.is_empty()
    })?;
    assert_eq!(seen, vec![Bytes::from_static(b"after")]);
    assert!(server.is_connected());
    Ok(())
}

#[test]
fn double_disconnect_emits_one_event() -> anyhow::Result<()> {
    init_tracing();
    let (mut host, mut client) = connected_pair(PeerConfig::default())?;

    let mut connects = 0;
    wait_until("connect event", || {
        connects += host
            .poll_events(100)
            .iter()
            .filter(|e| matches!(e, PeerEvent::Connect { .. }))
            .count();
        connects == 1
    })?;

    let conn = host.connections().remove(0);
    conn.disconnect();
    conn.disconnect();
    host.disconnect(&conn);
    assert!(!conn.is_connected());
    assert_eq!(host.connection_count(), 0);

    let mut disconnects = 0;
    let mut count = |host: &mut Peer| {
        disconnects += host
            .poll_events(100)
            .iter()
            .filter(|e| matches!(e, PeerEvent::Disconnect { .. }))
            .count();
        disconnects
    };
    wait_until("disconnect event", || count(&mut host) >= 1)?;
    never_within("second disconnect event", Duration::from_millis(100), || count(&mut host) > 1)?;

    // The remote side sees the close too.
    wait_until("client notices", || {
        client.update(100);
        client.connection_count() == 0
    })?;
    Ok(())
}

#[test]
fn silent_connection_times_out() -> anyhow::Result<()> {
    init_tracing();
    let config = PeerConfig::default().with_idle_timeout(Duration::from_millis(150));
    let (mut host, _client) = connected_pair(config)?;

    let mut dropped = None;
    wait_until("idle disconnect", || {
        for event in host.poll_events(100) {
            if let PeerEvent::Disconnect { connection, .. } = event {
                dropped = Some(connection);
            }
        }
        dropped.is_some()
    })?;
    assert!(dropped.is_some_and(|c| c.is_timed_out()));
    Ok(())
}

#[test]
fn client_without_timeout_stays_connected() -> anyhow::Result<()> {
    init_tracing();
    let (mut host, mut client) = connected_pair(PeerConfig::default())?;
    never_within("disconnect", Duration::from_millis(300), || {
        host.update(100);
        client.update(100);
        host.connection_count() == 0 || client.connection_count() == 0
    })?;
    Ok(())
}

/// A host and a plain TCP client that never reads what it is sent.
fn stalled_client(host: &mut Peer) -> anyhow::Result<(TcpStream, Connection)> {
    let port = host_ephemeral(host)?;
    let stream = TcpStream::connect(("127.0.0.1", port))?;
    wait_until("host sees client", || host.connection_count() == 1)?;
    let connection = host.connections().remove(0);
    Ok((stream, connection))
}

#[test]
fn disconnect_does_not_wait_for_a_stalled_reader() -> anyhow::Result<()> {
    init_tracing();
    let mut host = Peer::new(PeerConfig::default())?;
    let (mut stream, connection) = stalled_client(&mut host)?;

    let payload = vec![5u8; 60_000];
    for _ in 0..500 {
        connection.send(&payload);
    }
    let queued = 500 * (payload.len() + 2);
    connection.disconnect();

    // Only what already reached the socket buffers may still arrive.
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut delivered = Vec::new();
    stream.read_to_end(&mut delivered)?;
    assert!(
        delivered.len() < queued / 2,
        "{} of {queued} bytes delivered after disconnect",
        delivered.len()
    );
    Ok(())
}

#[test]
fn overflowing_the_send_queue_disconnects() -> anyhow::Result<()> {
    init_tracing();
    let mut host = Peer::new(PeerConfig::default())?;
    let (_stream, connection) = stalled_client(&mut host)?;

    let payload = vec![9u8; 60_000];
    for _ in 0..3 * SEND_QUEUE_FRAMES {
        connection.send(&payload);
        if !connection.is_connected() {
            break;
        }
    }
    assert!(!connection.is_connected());

    let mut disconnected = false;
    wait_until("disconnect event", || {
        disconnected |= host
            .poll_events(100)
            .iter()
            .any(|e| matches!(e, PeerEvent::Disconnect { .. }));
        disconnected
    })?;
    assert_eq!(host.connection_count(), 0);
    Ok(())
}
