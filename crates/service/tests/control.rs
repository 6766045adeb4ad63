use std::{
    io::{Read, Write},
    net::{Ipv4Addr, TcpStream},
    time::Duration,
};

use anyhow::Result;
use codec::control::{Message, decode, encode};
use codec::stream::ByteStream;
use lnsd_service::Shutdown;
use lnsd_service::control::ControlEngine;
use lnsd_service::names::NameTable;
use lnsd_service::reactor::Reactor;

struct Fixture {
    reactor: Reactor,
    engine: std::rc::Rc<std::cell::RefCell<ControlEngine>>,
    shutdown: Shutdown,
    port: u16,
}

fn ip(text: &str) -> Ipv4Addr {
    text.parse().unwrap()
}

/// An engine on an ephemeral loopback port over a peer map seeded the way a
/// live announce engine would have filled it.
fn fixture() -> Result<Fixture> {
    let names = NameTable::new();
    names.assign(ip("1.2.3.4"), "alpha");
    names.assign(ip("9.10.11.12"), "alpha");
    names.assign(ip("5.6.7.8"), "beta");

    let reactor = Reactor::new()?;
    let shutdown = Shutdown::new();
    let engine = ControlEngine::open(&reactor, 0, names, shutdown.clone())?;
    let port = engine.borrow().local_addr().unwrap().port();

    Ok(Fixture {
        reactor,
        engine,
        shutdown,
        port,
    })
}

fn connect(fixture: &Fixture) -> Result<TcpStream> {
    let client = TcpStream::connect(("127.0.0.1", fixture.port))?;
    client.set_read_timeout(Some(Duration::from_millis(200)))?;

    Ok(client)
}

fn pump(fixture: &Fixture, rounds: usize) {
    for _ in 0..rounds {
        fixture.reactor.poll(Some(0.05)).unwrap();
    }
}

/// Reads one reply off the client socket, or `None` when the server stays
/// quiet past the read timeout.
fn read_reply(client: &mut TcpStream) -> Option<Message> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).ok()?;

    let length = u16::from_le_bytes(header) as usize;
    let mut body = vec![0u8; length];
    client.read_exact(&mut body).ok()?;

    let mut bytes = header.to_vec();
    bytes.extend_from_slice(&body);

    decode(&mut ByteStream::from(bytes)).ok()
}

fn request(fixture: &Fixture, client: &mut TcpStream, message: &Message) -> Option<Message> {
    client.write_all(&encode(message).unwrap()).unwrap();
    pump(fixture, 4);
    read_reply(client)
}

#[test]
fn host_queries_return_every_address() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    let reply = request(
        &fixture,
        &mut client,
        &Message::Host {
            hostname: Some("alpha".into()),
        },
    );

    let Some(Message::Ip { mut addrs }) = reply else {
        panic!("expected an ip reply, got {reply:?}");
    };
    addrs.sort();
    assert_eq!(addrs, vec![ip("1.2.3.4"), ip("9.10.11.12")]);

    let reply = request(
        &fixture,
        &mut client,
        &Message::Host {
            hostname: Some("nonexistent".into()),
        },
    );
    assert_eq!(reply, Some(Message::Ip { addrs: vec![] }));

    Ok(())
}

#[test]
fn ip_queries_return_the_hostname_or_null() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    let reply = request(
        &fixture,
        &mut client,
        &Message::Ip {
            addrs: vec![ip("5.6.7.8")],
        },
    );
    assert_eq!(
        reply,
        Some(Message::Host {
            hostname: Some("beta".into())
        })
    );

    let reply = request(
        &fixture,
        &mut client,
        &Message::Ip {
            addrs: vec![ip("0.0.0.0")],
        },
    );
    assert_eq!(reply, Some(Message::Host { hostname: None }));

    Ok(())
}

#[test]
fn get_all_returns_the_whole_mapping() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    let reply = request(&fixture, &mut client, &Message::GetAll);
    let Some(Message::NameIpMapping { name_ips }) = reply else {
        panic!("expected the mapping, got {reply:?}");
    };

    assert_eq!(name_ips.len(), 2);
    let mut alpha = name_ips["alpha"].clone();
    alpha.sort();
    assert_eq!(alpha, vec![ip("1.2.3.4"), ip("9.10.11.12")]);
    assert_eq!(name_ips["beta"], vec![ip("5.6.7.8")]);

    Ok(())
}

#[test]
fn quit_gets_no_reply_and_stops_the_engine() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    assert!(fixture.engine.borrow().is_running());

    let reply = request(&fixture, &mut client, &Message::Quit);
    assert_eq!(reply, None);
    assert!(!fixture.engine.borrow().is_running());
    assert!(fixture.shutdown.is_set());

    Ok(())
}

#[test]
fn multi_address_lookups_go_unanswered() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    let reply = request(
        &fixture,
        &mut client,
        &Message::Ip {
            addrs: vec![ip("1.2.3.4"), ip("5.6.7.8")],
        },
    );
    assert_eq!(reply, None);

    // The connection survives for the next request.
    let reply = request(&fixture, &mut client, &Message::GetAll);
    assert!(matches!(reply, Some(Message::NameIpMapping { .. })));

    Ok(())
}

#[test]
fn malformed_frames_are_skipped() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    // An unknown type followed by a valid request in the same write: the
    // bad frame is consumed, the good one is answered.
    let body = br#"{"type":"bogus"}"#;
    let mut bytes = (body.len() as u16).to_le_bytes().to_vec();
    bytes.extend_from_slice(body);
    bytes.extend_from_slice(&encode(&Message::GetAll)?);

    client.write_all(&bytes)?;
    pump(&fixture, 4);

    assert!(matches!(
        read_reply(&mut client),
        Some(Message::NameIpMapping { .. })
    ));
    assert!(read_reply(&mut client).is_none());

    Ok(())
}

#[test]
fn validation_failures_disconnect_the_client() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;

    let body = br#"{"type":"ip","ip_addrs":["999.0.0.1"]}"#;
    let mut bytes = (body.len() as u16).to_le_bytes().to_vec();
    bytes.extend_from_slice(body);

    client.write_all(&bytes)?;
    pump(&fixture, 4);

    // The server hung up: reads drain to EOF rather than timing out.
    let mut scratch = [0u8; 16];
    assert_eq!(client.read(&mut scratch)?, 0);

    Ok(())
}

#[test]
fn a_frame_fed_byte_by_byte_yields_exactly_one_reply() -> Result<()> {
    let fixture = fixture()?;
    let mut client = connect(&fixture)?;
    pump(&fixture, 2);

    let bytes = encode(&Message::GetAll)?;
    let (last, rest) = bytes.split_last().unwrap();

    for byte in rest {
        client.write_all(&[*byte])?;
        pump(&fixture, 1);
    }

    // Everything but the final byte is in: still no reply.
    assert!(read_reply(&mut client).is_none());

    client.write_all(&[*last])?;
    pump(&fixture, 4);

    assert!(matches!(
        read_reply(&mut client),
        Some(Message::NameIpMapping { .. })
    ));

    Ok(())
}

#[test]
fn disconnected_clients_are_purged() -> Result<()> {
    let fixture = fixture()?;

    let client = connect(&fixture)?;
    pump(&fixture, 2);
    drop(client);
    pump(&fixture, 2);

    // A second client still gets served.
    let mut client = connect(&fixture)?;
    let reply = request(&fixture, &mut client, &Message::GetAll);
    assert!(matches!(reply, Some(Message::NameIpMapping { .. })));

    Ok(())
}
