//! The announce protocol engine.
//!
//! Every participant broadcasts a 512-byte announce frame on a shared UDP
//! port and learns its peers from the frames it hears, including its own.
//! The engine keeps one receive buffer per peer IP so that a truncated
//! datagram stays queued until the rest of the frame shows up, and evicts
//! any peer that goes quiet for longer than the TTL.

use std::{
    cell::RefCell,
    collections::HashMap as StdHashMap,
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    os::fd::{AsRawFd, FromRawFd},
    rc::Rc,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use codec::announce::{Announce, FRAME_SIZE};
use codec::stream::ByteStream;

use crate::{
    names::NameTable,
    reactor::{Interest, Reactor, cvt},
};

/// The announce channel's default UDP port.
pub const NET_PORT: u16 = 15051;

/// How often to announce to the network.
pub const ANNOUNCE_ALARM: Duration = Duration::from_secs(10);

/// How long to wait for a peer's next announce before dropping it.
pub const ANNOUNCE_TTL: Duration = Duration::from_secs(30);

pub struct AnnounceOptions {
    pub hostname: String,
    pub port: u16,
    pub alarm: Duration,
    pub ttl: Duration,
}

impl AnnounceOptions {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: NET_PORT,
            alarm: ANNOUNCE_ALARM,
            ttl: ANNOUNCE_TTL,
        }
    }
}

/// Broadcasts this host's name and maintains the peer map from everyone
/// else's announces.
pub struct AnnounceEngine {
    socket: Option<UdpSocket>,
    hostname: String,
    port: u16,
    alarm: Duration,
    ttl: Duration,
    names: NameTable,
    peer_buffers: HashMap<Ipv4Addr, ByteStream>,
    peer_seen: HashMap<Ipv4Addr, Instant>,
    last_announce: Option<Instant>,
}

impl AnnounceEngine {
    /// Binds the broadcast socket, registers it on the reactor, installs the
    /// heartbeat step callback, and announces immediately so the daemon
    /// shows up on the network without waiting a full alarm interval.
    pub fn open(
        reactor: &Reactor,
        options: AnnounceOptions,
        names: NameTable,
    ) -> io::Result<Rc<RefCell<Self>>> {
        codec::verify_hostname(&options.hostname)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let socket = broadcast_socket(options.port)?;
        let port = socket.local_addr()?.port();
        let fd = socket.as_raw_fd();

        log::debug!("announce engine bound: port={port}");

        let engine = Rc::new(RefCell::new(Self {
            socket: Some(socket),
            hostname: options.hostname,
            port,
            alarm: options.alarm,
            ttl: options.ttl,
            names,
            peer_buffers: HashMap::new(),
            peer_seen: HashMap::new(),
            last_announce: None,
        }));

        let on_message = engine.clone();
        reactor.bind(fd, Interest::READABLE, move |_, _, _| {
            on_message.borrow_mut().on_message();
        })?;

        let on_tick = engine.clone();
        reactor.add_step_callback(move |_| on_tick.borrow_mut().tick());

        engine.borrow_mut().tick();

        Ok(engine)
    }

    /// Unregisters and closes the network socket.
    pub fn close(&mut self, reactor: &Reactor) {
        if let Some(socket) = self.socket.take() {
            let _ = reactor.unbind(socket.as_raw_fd(), None);
        }
    }

    /// The heartbeat, run after every reactor poll.
    ///
    /// The early return is the amplification breaker: the socket hears its
    /// own broadcasts, and without the throttle each one would trigger the
    /// next.
    pub fn tick(&mut self) {
        if let Some(last) = self.last_announce {
            if last.elapsed() < self.alarm {
                return;
            }
        }

        // Stamped even when the send fails, so a downed network does not
        // turn the heartbeat into a hot loop.
        self.last_announce = Some(Instant::now());
        self.broadcast();
        self.sweep();
    }

    /// Seconds until the next announce is due; the supervisor uses this as
    /// the reactor's poll timeout so the loop wakes exactly in time.
    pub fn time_until_next_announce(&self) -> f64 {
        match self.last_announce {
            None => 0.0,
            Some(last) => (self.alarm.as_secs_f64() - last.elapsed().as_secs_f64()).max(0.0),
        }
    }

    pub fn query_host(&self, hostname: &str) -> Vec<Ipv4Addr> {
        self.names.query_host(hostname)
    }

    pub fn query_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.names.query_ip(ip)
    }

    pub fn host_ip_map(&self) -> StdHashMap<String, Vec<Ipv4Addr>> {
        self.names.snapshot()
    }

    fn broadcast(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };

        let frame = match Announce::new(self.hostname.clone()).encode() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("announce frame rejected: {err}");
                return;
            }
        };

        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
        let mut sent = 0;
        while sent < frame.len() {
            match socket.send_to(&frame[sent..], target) {
                Ok(count) => sent += count,
                Err(err) => {
                    // Transient disconnects are survivable; the socket stays
                    // open and the next tick retries.
                    log::debug!("announce send failed: {err}");
                    return;
                }
            }
        }

        log::debug!("sent an announce: hostname={}", self.hostname);
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<Ipv4Addr> = self
            .peer_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.ttl)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in expired {
            log::debug!("dropping quiet peer: {peer}");
            self.peer_seen.remove(&peer);
            self.peer_buffers.remove(&peer);
            self.names.remove(peer);
        }
    }

    fn on_message(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };

        let mut datagram = [0u8; FRAME_SIZE];
        let (length, sender) = match socket.recv_from(&mut datagram) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(err) => {
                log::warn!("announce recv failed: {err}");
                return;
            }
        };

        // The announce channel is IPv4 broadcast only.
        let SocketAddr::V4(sender) = sender else {
            return;
        };

        self.ingest(*sender.ip(), &datagram[..length]);
    }

    /// Queues raw datagram bytes from a peer and extracts every complete
    /// frame. A short tail stays in the buffer for the next datagram;
    /// a full-size frame that does not parse is dropped on the floor.
    pub fn ingest(&mut self, peer: Ipv4Addr, data: &[u8]) {
        log::debug!("{} bytes of announce data from {peer}", data.len());

        let buffer = self.peer_buffers.entry(peer).or_default();
        buffer.push(data);

        loop {
            let mut txn = buffer.begin();
            let frame = txn.stream().read(FRAME_SIZE);
            if frame.len() < FRAME_SIZE {
                // The last, partial frame stays queued; rolling back the
                // transaction puts the bytes we just read back in place.
                txn.abort();
                break;
            }
            txn.commit();

            let message = match Announce::decode(&frame) {
                Ok(message) => message,
                Err(_) => continue,
            };

            self.peer_seen.insert(peer, Instant::now());
            self.names.assign(peer, message.hostname());

            log::debug!("{peer} -> {}", message.hostname());
        }

        buffer.compact();
    }
}

/// A non-blocking IPv4 datagram socket bound to `0.0.0.0:port` with
/// `SO_REUSEADDR` and `SO_BROADCAST`. The std socket API cannot set either
/// option before bind, so the socket is assembled through libc and then
/// handed over.
fn broadcast_socket(port: u16) -> io::Result<UdpSocket> {
    unsafe {
        let fd = cvt(libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0))?;

        let enable: libc::c_int = 1;
        for option in [libc::SO_REUSEADDR, libc::SO_BROADCAST] {
            if let Err(err) = cvt(libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &enable as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )) {
                libc::close(fd);
                return Err(err);
            }
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;

        if let Err(err) = cvt(libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )) {
            libc::close(fd);
            return Err(err);
        }

        let socket = UdpSocket::from_raw_fd(fd);
        socket.set_nonblocking(true)?;

        Ok(socket)
    }
}
