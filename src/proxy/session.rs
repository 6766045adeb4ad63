//! SOCKS5 session state machines.
//!
//! Every accepted connection starts as a [`PreSession`] that works through
//! the greeting and the request, then hands its socket to one of the three
//! session types. Sessions own their sockets and live inside the reactor's
//! callback table; tearing one down unbinds its descriptors, which drops the
//! last reference and closes the sockets.

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use codec::socks::{
    Command, Greeting, METHOD_NO_AUTH, METHOD_UNACCEPTABLE, Reply, ReplyCode, Request, VERSION,
};
use codec::stream::ByteStream;
use service::{
    names::NameTable,
    reactor::{Event, Interest, Reactor, SendQueue},
};

use super::resolve;

const HANDSHAKE_CHUNK: usize = 4096;
const RELAY_CHUNK: usize = 16 * 1024;

/// Sends a whole SOCKS reply in one shot. Replies are a few bytes, so a
/// socket that will not take them immediately is not worth waiting on.
fn send_reply(stream: &mut TcpStream, code: ReplyCode, addr: SocketAddr) -> io::Result<()> {
    stream.write_all(&Reply { code, addr }.encode())
}

fn send_failure(stream: &mut TcpStream, code: ReplyCode) {
    let _ = stream.write_all(&Reply::failure(code).encode());
}

/// Greeting and request parsing, before a session type takes over.
pub struct PreSession {
    client: Option<TcpStream>,
    buffer: ByteStream,
    greeted: bool,
    names: NameTable,
}

impl PreSession {
    pub fn start(reactor: &Reactor, client: TcpStream, names: NameTable) {
        if client.set_nonblocking(true).is_err() {
            return;
        }

        let fd = client.as_raw_fd();
        let this = Rc::new(RefCell::new(Self {
            client: Some(client),
            buffer: ByteStream::new(),
            greeted: false,
            names,
        }));

        let on_event = this.clone();
        let _ = reactor.bind(
            fd,
            Interest::READABLE | Interest::ERROR,
            move |reactor, fd, event| match event {
                Event::Error => {
                    let _ = reactor.unbind(fd, None);
                }
                _ => Self::on_readable(&on_event, reactor, fd),
            },
        );
    }

    fn on_readable(this: &Rc<RefCell<Self>>, reactor: &Reactor, fd: RawFd) {
        let mut guard = this.borrow_mut();
        let me = &mut *guard;

        let Some(client) = me.client.as_mut() else {
            return;
        };

        let mut chunk = [0u8; HANDSHAKE_CHUNK];
        match client.read(&mut chunk) {
            Ok(0) => {
                let _ = reactor.unbind(fd, None);
                me.client = None;
                return;
            }
            Ok(count) => me.buffer.push(&chunk[..count]),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(_) => {
                let _ = reactor.unbind(fd, None);
                me.client = None;
                return;
            }
        }

        if !me.greeted {
            let mut txn = me.buffer.begin();
            match Greeting::decode(txn.stream()) {
                Ok(greeting) => {
                    txn.commit();
                    me.greeted = true;

                    let accepted = greeting.methods.contains(&METHOD_NO_AUTH);
                    let method = if accepted {
                        METHOD_NO_AUTH
                    } else {
                        METHOD_UNACCEPTABLE
                    };

                    let reply_failed = match me.client.as_mut() {
                        Some(client) => client.write_all(&[VERSION, method]).is_err(),
                        None => return,
                    };

                    if reply_failed || !accepted {
                        let _ = reactor.unbind(fd, None);
                        me.client = None;
                        return;
                    }
                }
                Err(codec::Error::UnexpectedEof) => {
                    txn.abort();
                    return;
                }
                Err(err) => {
                    txn.abort();
                    log::debug!("bad socks greeting: {err}");
                    let _ = reactor.unbind(fd, None);
                    me.client = None;
                    return;
                }
            }
        }

        let mut txn = me.buffer.begin();
        match Request::decode(txn.stream()) {
            Ok(request) => {
                txn.commit();

                let _ = reactor.unbind(fd, None);
                let Some(client) = me.client.take() else {
                    return;
                };
                let names = me.names.clone();
                drop(guard);

                dispatch(reactor, client, request, names);
            }
            Err(codec::Error::UnexpectedEof) => txn.abort(),
            Err(err) => {
                txn.abort();
                log::debug!("bad socks request: {err}");
                let _ = reactor.unbind(fd, None);
                me.client = None;
            }
        }
    }
}

fn dispatch(reactor: &Reactor, client: TcpStream, request: Request, names: NameTable) {
    match request.command {
        Command::Connect => connect_session(reactor, client, &request, &names),
        Command::Bind => BindSession::start(reactor, client),
        Command::UdpAssociate => AssociateSession::start(reactor, client, names),
    }
}

/// CONNECT: dial the target, report the bound address, then relay.
fn connect_session(reactor: &Reactor, mut client: TcpStream, request: &Request, names: &NameTable) {
    let target = match resolve(names, &request.addr, request.port) {
        Ok(target) => target,
        Err(_) => {
            send_failure(&mut client, ReplyCode::HostUnreachable);
            return;
        }
    };

    let peer = match TcpStream::connect(target) {
        Ok(peer) => peer,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            send_failure(&mut client, ReplyCode::ConnectionRefused);
            return;
        }
        Err(_) => {
            send_failure(&mut client, ReplyCode::HostUnreachable);
            return;
        }
    };

    let Ok(bound) = peer.local_addr() else {
        send_failure(&mut client, ReplyCode::HostUnreachable);
        return;
    };

    if send_reply(&mut client, ReplyCode::Succeeded, bound).is_err() {
        return;
    }

    if peer.set_nonblocking(true).is_err() {
        return;
    }

    log::debug!("socks connect relay open: target={target}");
    Relay::start(reactor, client, peer);
}

/// A bidirectional byte pump between two established streams. Used by
/// CONNECT right away and by BIND once its one inbound connection arrives.
struct Relay {
    client: TcpStream,
    peer: TcpStream,
    client_out: SendQueue,
    peer_out: SendQueue,
    client_write_bound: bool,
    peer_write_bound: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Client,
    Peer,
}

impl Relay {
    fn start(reactor: &Reactor, client: TcpStream, peer: TcpStream) {
        let client_fd = client.as_raw_fd();
        let peer_fd = peer.as_raw_fd();

        let this = Rc::new(RefCell::new(Self {
            client,
            peer,
            client_out: SendQueue::default(),
            peer_out: SendQueue::default(),
            client_write_bound: false,
            peer_write_bound: false,
        }));

        for (fd, side) in [(client_fd, Side::Client), (peer_fd, Side::Peer)] {
            let on_event = this.clone();
            let _ = reactor.bind(
                fd,
                Interest::READABLE | Interest::ERROR,
                move |reactor, _, event| match event {
                    Event::Error => Self::teardown(&on_event, reactor),
                    _ => Self::pump(&on_event, reactor, side),
                },
            );
        }
    }

    fn fds(&self) -> (RawFd, RawFd) {
        (self.client.as_raw_fd(), self.peer.as_raw_fd())
    }

    fn teardown(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let (client_fd, peer_fd) = this.borrow().fds();
        let _ = reactor.unbind(client_fd, None);
        let _ = reactor.unbind(peer_fd, None);
    }

    /// Moves one chunk from `side` to the opposite queue.
    fn pump(this: &Rc<RefCell<Self>>, reactor: &Reactor, side: Side) {
        let mut chunk = [0u8; RELAY_CHUNK];
        let mut closed = false;

        {
            let relay = &mut *this.borrow_mut();
            let (source, sink_queue) = match side {
                Side::Client => (&mut relay.client, &mut relay.peer_out),
                Side::Peer => (&mut relay.peer, &mut relay.client_out),
            };

            match source.read(&mut chunk) {
                Ok(0) => closed = true,
                Ok(count) => sink_queue.push(&chunk[..count]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => closed = true,
            }
        }

        if closed {
            Self::teardown(this, reactor);
            return;
        }

        // Data read off one side flushes toward the other.
        let opposite = match side {
            Side::Client => Side::Peer,
            Side::Peer => Side::Client,
        };

        Self::flush(this, reactor, opposite);
    }

    /// Drains `side`'s outbound queue, parking the residue under writable
    /// interest when the socket pushes back.
    fn flush(this: &Rc<RefCell<Self>>, reactor: &Reactor, side: Side) {
        let mut failed = false;

        {
            let relay = &mut *this.borrow_mut();
            let (stream, queue, write_bound) = match side {
                Side::Client => (
                    &mut relay.client,
                    &mut relay.client_out,
                    &mut relay.client_write_bound,
                ),
                Side::Peer => (
                    &mut relay.peer,
                    &mut relay.peer_out,
                    &mut relay.peer_write_bound,
                ),
            };

            match queue.flush(stream) {
                Ok(true) => {
                    if *write_bound {
                        *write_bound = false;
                        let _ = reactor.unbind(stream.as_raw_fd(), Some(Interest::WRITABLE));
                    }
                }
                Ok(false) => {
                    if !*write_bound {
                        *write_bound = true;

                        let fd = stream.as_raw_fd();
                        let on_writable = this.clone();
                        let bound = reactor.bind(fd, Interest::WRITABLE, move |reactor, _, _| {
                            Self::flush(&on_writable, reactor, side);
                        });

                        if bound.is_err() {
                            failed = true;
                        }
                    }
                }
                Err(_) => failed = true,
            }
        }

        if failed {
            Self::teardown(this, reactor);
        }
    }
}

/// BIND: listen once, report the listener, relay the one connection that
/// shows up.
struct BindSession {
    client: Option<TcpStream>,
    listener: Option<TcpListener>,
}

impl BindSession {
    fn start(reactor: &Reactor, mut client: TcpStream) {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener));

        let listener = match listener {
            Ok(listener) => listener,
            Err(_) => {
                send_failure(&mut client, ReplyCode::HostUnreachable);
                return;
            }
        };

        let Ok(bound) = listener.local_addr() else {
            send_failure(&mut client, ReplyCode::HostUnreachable);
            return;
        };

        // First reply: where the peer should connect.
        if send_reply(&mut client, ReplyCode::Succeeded, bound).is_err() {
            return;
        }

        log::debug!("socks bind waiting: addr={bound}");

        let fd = listener.as_raw_fd();
        let this = Rc::new(RefCell::new(Self {
            client: Some(client),
            listener: Some(listener),
        }));

        let on_event = this.clone();
        let _ = reactor.bind(
            fd,
            Interest::READABLE | Interest::ERROR,
            move |reactor, fd, event| match event {
                Event::Error => {
                    let _ = reactor.unbind(fd, None);
                }
                _ => Self::on_connection(&on_event, reactor, fd),
            },
        );
    }

    fn on_connection(this: &Rc<RefCell<Self>>, reactor: &Reactor, fd: RawFd) {
        let mut me = this.borrow_mut();

        let Some(listener) = me.listener.as_ref() else {
            return;
        };

        let (peer, peer_addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => {
                let _ = reactor.unbind(fd, None);
                me.listener = None;
                me.client = None;
                return;
            }
        };

        // BIND is strictly one-to-one; the listener's job is done.
        let _ = reactor.unbind(fd, None);
        me.listener = None;

        let Some(mut client) = me.client.take() else {
            return;
        };
        drop(me);

        if peer.set_nonblocking(true).is_err() {
            return;
        }

        // Second reply: who connected.
        if send_reply(&mut client, ReplyCode::Succeeded, peer_addr).is_err() {
            return;
        }

        log::debug!("socks bind relay open: peer={peer_addr}");
        Relay::start(reactor, client, peer);
    }
}

/// UDP ASSOCIATE: one relay socket per association, held open for as long
/// as the control connection lives.
struct AssociateSession {
    control: TcpStream,
    relay: UdpSocket,
    client_ip: IpAddr,
    names: NameTable,
}

impl AssociateSession {
    fn start(reactor: &Reactor, mut control: TcpStream, names: NameTable) {
        let relay = UdpSocket::bind(("0.0.0.0", 0))
            .and_then(|relay| relay.set_nonblocking(true).map(|_| relay));

        let relay = match relay {
            Ok(relay) => relay,
            Err(_) => {
                send_failure(&mut control, ReplyCode::HostUnreachable);
                return;
            }
        };

        let (Ok(bound), Ok(client_addr)) = (relay.local_addr(), control.peer_addr()) else {
            send_failure(&mut control, ReplyCode::HostUnreachable);
            return;
        };

        if send_reply(&mut control, ReplyCode::Succeeded, bound).is_err() {
            return;
        }

        log::debug!("socks udp association open: relay={bound}");

        let control_fd = control.as_raw_fd();
        let relay_fd = relay.as_raw_fd();

        let this = Rc::new(RefCell::new(Self {
            control,
            relay,
            client_ip: client_addr.ip(),
            names,
        }));

        // The association lives exactly as long as the control connection.
        let on_control = this.clone();
        let _ = reactor.bind(
            control_fd,
            Interest::READABLE | Interest::ERROR,
            move |reactor, _, event| match event {
                Event::Error => Self::teardown(&on_control, reactor),
                _ => Self::on_control_data(&on_control, reactor),
            },
        );

        let on_datagram = this.clone();
        let _ = reactor.bind(
            relay_fd,
            Interest::READABLE | Interest::ERROR,
            move |reactor, _, event| match event {
                Event::Error => Self::teardown(&on_datagram, reactor),
                _ => Self::on_datagram(&on_datagram),
            },
        );
    }

    fn teardown(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let me = this.borrow();
        let _ = reactor.unbind(me.control.as_raw_fd(), None);
        let _ = reactor.unbind(me.relay.as_raw_fd(), None);
    }

    fn on_control_data(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        let mut closed = false;

        {
            let me = &mut *this.borrow_mut();
            let mut scratch = [0u8; HANDSHAKE_CHUNK];

            match me.control.read(&mut scratch) {
                // Anything the client says here is noise; only the close
                // matters.
                Ok(0) => closed = true,
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => closed = true,
            }
        }

        if closed {
            log::debug!("socks udp association closed");
            Self::teardown(this, reactor);
        }
    }

    fn on_datagram(this: &Rc<RefCell<Self>>) {
        let me = &mut *this.borrow_mut();

        let mut datagram = [0u8; 65536];
        let (length, sender) = match me.relay.recv_from(&mut datagram) {
            Ok(received) => received,
            Err(_) => return,
        };

        // Only the associated client may speak through the relay.
        if sender.ip() != me.client_ip {
            return;
        }

        let mut stream = ByteStream::from(&datagram[..length]);
        let header = match codec::socks::UdpHeader::decode(&mut stream) {
            Ok(header) => header,
            Err(_) => return,
        };

        // Fragmented datagrams are unsupported and dropped.
        if header.frag != 0 {
            return;
        }

        let Ok(target) = resolve(&me.names, &header.addr, header.port) else {
            return;
        };

        let payload = &datagram[stream.position()..length];
        let _ = me.relay.send_to(payload, target);
    }
}
