use std::{
    cell::Cell,
    net::UdpSocket,
    os::fd::AsRawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::Result;
use lnsd_service::reactor::{Backend, Event, Interest, Reactor};

fn udp_pair() -> Result<(UdpSocket, UdpSocket)> {
    let a = UdpSocket::bind("127.0.0.1:0")?;
    let b = UdpSocket::bind("127.0.0.1:0")?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;

    Ok((a, b))
}

fn backends() -> Vec<Backend> {
    let mut backends = vec![Backend::Poll, Backend::Select];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    backends.insert(0, Backend::Epoll);

    backends
}

#[test]
fn dispatches_readable_once_per_ready_event() -> Result<()> {
    for backend in backends() {
        let reactor = Reactor::with_backend(backend)?;
        let (a, b) = udp_pair()?;

        let hits = Rc::new(Cell::new(0u32));
        let seen = hits.clone();
        let receiver = a.try_clone()?;
        reactor.bind(a.as_raw_fd(), Interest::READABLE, move |_, _, event| {
            assert_eq!(event, Event::Readable);
            seen.set(seen.get() + 1);

            let mut scratch = [0u8; 16];
            let _ = receiver.recv_from(&mut scratch);
        })?;

        b.send_to(b"ping", a.local_addr()?)?;
        reactor.poll(Some(1.0))?;

        assert_eq!(hits.get(), 1, "backend {backend:?}");
    }

    Ok(())
}

#[test]
fn dispatches_writable() -> Result<()> {
    for backend in backends() {
        let reactor = Reactor::with_backend(backend)?;
        let (_, b) = udp_pair()?;

        let hits = Rc::new(Cell::new(0u32));
        let seen = hits.clone();
        reactor.bind(b.as_raw_fd(), Interest::WRITABLE, move |reactor, fd, _| {
            seen.set(seen.get() + 1);

            // Writable stays asserted on an idle socket, so a one-shot
            // binding keeps the test to a single hit.
            let _ = reactor.unbind(fd, Some(Interest::WRITABLE));
        })?;

        reactor.poll(Some(1.0))?;
        reactor.poll(Some(0.0))?;

        assert_eq!(hits.get(), 1, "backend {backend:?}");
        assert!(!reactor.has_clients());
    }

    Ok(())
}

#[test]
fn unbind_stops_dispatch() -> Result<()> {
    for backend in backends() {
        let reactor = Reactor::with_backend(backend)?;
        let (a, b) = udp_pair()?;

        let hits = Rc::new(Cell::new(0u32));
        let seen = hits.clone();
        reactor.bind(a.as_raw_fd(), Interest::READABLE, move |_, _, _| {
            seen.set(seen.get() + 1);
        })?;

        assert!(reactor.has_clients());
        reactor.unbind(a.as_raw_fd(), None)?;
        assert!(!reactor.has_clients());

        b.send_to(b"ping", a.local_addr()?)?;
        reactor.poll(Some(0.2))?;

        assert_eq!(hits.get(), 0, "backend {backend:?}");
    }

    Ok(())
}

#[test]
fn additive_bind_keeps_both_events() -> Result<()> {
    let reactor = Reactor::new()?;
    let (a, b) = udp_pair()?;

    let reads = Rc::new(Cell::new(0u32));
    let writes = Rc::new(Cell::new(0u32));

    let seen = reads.clone();
    let receiver = a.try_clone()?;
    reactor.bind(a.as_raw_fd(), Interest::READABLE, move |_, _, _| {
        seen.set(seen.get() + 1);

        let mut scratch = [0u8; 16];
        let _ = receiver.recv_from(&mut scratch);
    })?;

    let seen = writes.clone();
    reactor.bind(a.as_raw_fd(), Interest::WRITABLE, move |reactor, fd, _| {
        seen.set(seen.get() + 1);
        let _ = reactor.unbind(fd, Some(Interest::WRITABLE));
    })?;

    b.send_to(b"ping", a.local_addr()?)?;
    reactor.poll(Some(1.0))?;

    assert_eq!(reads.get(), 1);
    assert_eq!(writes.get(), 1);

    // Only writable interest was dropped; the socket still reports reads.
    b.send_to(b"ping", a.local_addr()?)?;
    reactor.poll(Some(1.0))?;
    assert_eq!(reads.get(), 2);
    assert_eq!(writes.get(), 1);

    Ok(())
}

#[test]
fn step_callbacks_run_once_per_poll_even_without_events() -> Result<()> {
    for backend in backends() {
        let reactor = Reactor::with_backend(backend)?;

        let ticks = Rc::new(Cell::new(0u32));
        let seen = ticks.clone();
        reactor.add_step_callback(move |_| seen.set(seen.get() + 1));

        for _ in 0..3 {
            reactor.poll(Some(0.0))?;
        }

        assert_eq!(ticks.get(), 3, "backend {backend:?}");
    }

    Ok(())
}

#[test]
fn select_backend_sleeps_through_an_empty_registry() -> Result<()> {
    let reactor = Reactor::with_backend(Backend::Select)?;

    let ticks = Rc::new(Cell::new(0u32));
    let seen = ticks.clone();
    reactor.add_step_callback(move |_| seen.set(seen.get() + 1));

    let started = Instant::now();
    reactor.poll(Some(0.05))?;

    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(ticks.get(), 1);

    Ok(())
}

#[test]
fn zero_timeout_returns_immediately() -> Result<()> {
    for backend in backends() {
        let reactor = Reactor::with_backend(backend)?;
        let (a, _) = udp_pair()?;
        reactor.bind(a.as_raw_fd(), Interest::READABLE, |_, _, _| {})?;

        let started = Instant::now();
        reactor.poll(Some(0.0))?;

        assert!(
            started.elapsed() < Duration::from_millis(100),
            "backend {backend:?}"
        );
    }

    Ok(())
}

#[test]
fn callbacks_may_rebind_during_dispatch() -> Result<()> {
    let reactor = Reactor::new()?;
    let (a, b) = udp_pair()?;
    let (c, d) = udp_pair()?;

    let second_hits = Rc::new(Cell::new(0u32));

    // The first callback registers a second descriptor from inside
    // dispatch; the registration must take effect for later polls.
    let seen = second_hits.clone();
    let second_fd = c.as_raw_fd();
    let receiver = a.try_clone()?;
    reactor.bind(a.as_raw_fd(), Interest::READABLE, move |reactor, _, _| {
        let mut scratch = [0u8; 16];
        let _ = receiver.recv_from(&mut scratch);

        let seen = seen.clone();
        let _ = reactor.bind(second_fd, Interest::READABLE, move |_, _, _| {
            seen.set(seen.get() + 1);
        });
    })?;

    b.send_to(b"ping", a.local_addr()?)?;
    reactor.poll(Some(1.0))?;
    assert_eq!(second_hits.get(), 0);

    d.send_to(b"ping", c.local_addr()?)?;
    reactor.poll(Some(1.0))?;
    assert_eq!(second_hits.get(), 1);

    Ok(())
}
