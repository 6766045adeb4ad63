//! The SOCKS5 proxy.
//!
//! A thin SOCKS5 server whose one trick is the `.lan` pseudo-TLD: a domain
//! ending in `.lan` resolves through the daemon's peer map instead of DNS,
//! so `curl http://box.lan/` works on a network with no name server. It
//! runs on its own thread with its own reactor and shares nothing with the
//! daemon core except the peer map handle and the shutdown event.

mod session;

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs},
    os::fd::AsRawFd,
};

use codec::socks::TargetAddr;
use service::{
    Shutdown,
    names::NameTable,
    reactor::{Interest, Reactor},
};

/// The proxy's default listening port.
pub const SOCKS_PORT: u16 = 1080;

/// How long the accept loop sleeps in poll before re-checking the shutdown
/// event.
const POLL_INTERVAL: f64 = 5.0;

/// Accepts SOCKS5 clients until the shutdown event fires. Sessions live in
/// the reactor's callback table; dropping the reactor on the way out closes
/// whatever sockets are still open.
pub fn run(names: NameTable, port: u16, shutdown: Shutdown) -> io::Result<()> {
    let reactor = Reactor::new()?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
    listener.set_nonblocking(true)?;
    let fd = listener.as_raw_fd();

    log::info!("socks proxy listening: port={}", listener.local_addr()?.port());

    reactor.bind(fd, Interest::READABLE, move |reactor, _, _| {
        loop {
            match listener.accept() {
                Ok((client, peer)) => {
                    log::debug!("socks client connected: {peer}");
                    session::PreSession::start(reactor, client, names.clone());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::warn!("socks accept failed: {err}");
                    break;
                }
            }
        }
    })?;

    while !shutdown.is_set() {
        reactor.poll(Some(POLL_INTERVAL))?;
    }

    log::debug!("socks proxy shut down");

    Ok(())
}

/// Turns a request target into a connectable address. A `.lan` name found
/// in the peer map short-circuits; everything else, including a `.lan` name
/// nobody has announced, goes to the system resolver as-is.
fn resolve(names: &NameTable, target: &TargetAddr, port: u16) -> io::Result<SocketAddr> {
    match target {
        TargetAddr::Ipv4(addr) => Ok(SocketAddr::from((*addr, port))),
        TargetAddr::Ipv6(addr) => Ok(SocketAddr::from((*addr, port))),
        TargetAddr::Domain(host) => {
            if let Some(name) = host.strip_suffix(".lan") {
                if let Some(addr) = names.query_host(name).first() {
                    return Ok(SocketAddr::from((*addr, port)));
                }
            }

            (host.as_str(), port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lan_names_resolve_through_the_peer_map() {
        let names = NameTable::new();
        names.assign("10.0.0.7".parse().unwrap(), "box");

        let resolved = resolve(&names, &TargetAddr::Domain("box.lan".into()), 80).unwrap();
        assert_eq!(resolved, "10.0.0.7:80".parse().unwrap());
    }

    #[test]
    fn literal_addresses_pass_straight_through() {
        let names = NameTable::new();

        let resolved = resolve(
            &names,
            &TargetAddr::Ipv4("192.0.2.1".parse().unwrap()),
            443,
        )
        .unwrap();
        assert_eq!(resolved, "192.0.2.1:443".parse().unwrap());

        let resolved = resolve(&names, &TargetAddr::Ipv6("::1".parse().unwrap()), 443).unwrap();
        assert_eq!(resolved, "[::1]:443".parse().unwrap());
    }
}
