//! The control protocol engine.
//!
//! A loopback TCP server that answers queries about the peer map. Each
//! client gets a receive buffer parsed through stream transactions, so a
//! request split across reads is simply retried once the rest arrives, and
//! an undecodable frame is skipped without losing the client. Replies are
//! queued per client and flushed under writable interest, keeping the
//! reactor thread free of blocking writes.

use std::{
    cell::RefCell,
    io::{self, Read},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};

use ahash::{HashMap, HashMapExt};
use codec::control::{self, Message};
use codec::stream::ByteStream;

use crate::{
    Shutdown,
    names::NameTable,
    reactor::{Event, Interest, Reactor, SendQueue},
};

/// The control server's default TCP port.
pub const CONTROL_PORT: u16 = 10771;

/// Most control messages fit comfortably inside one read of this size.
const RECV_CHUNK: usize = 1024;

struct Client {
    stream: TcpStream,
    inbound: ByteStream,
    outbound: SendQueue,
    write_bound: bool,
}

impl Client {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            inbound: ByteStream::new(),
            outbound: SendQueue::default(),
            write_bound: false,
        }
    }
}

/// Answers local queries against the peer map and owns the daemon's quit
/// path.
pub struct ControlEngine {
    listener: Option<TcpListener>,
    names: NameTable,
    shutdown: Shutdown,
    clients: HashMap<RawFd, Client>,
    done: bool,
}

impl ControlEngine {
    /// Binds the loopback listener and registers it on the reactor. A port
    /// that is already taken is fatal: the error propagates to the
    /// supervisor, which tears the daemon down.
    pub fn open(
        reactor: &Reactor,
        port: u16,
        names: NameTable,
        shutdown: Shutdown,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();

        log::info!(
            "control server listening: port={}",
            listener.local_addr()?.port()
        );

        let engine = Rc::new(RefCell::new(Self {
            listener: Some(listener),
            names,
            shutdown,
            clients: HashMap::new(),
            done: false,
        }));

        let on_accept = engine.clone();
        reactor.bind(fd, Interest::READABLE, move |reactor, _, _| {
            Self::on_accept(&on_accept, reactor);
        })?;

        Ok(engine)
    }

    /// False once a quit command has been handled; the supervisor's loop
    /// condition.
    pub fn is_running(&self) -> bool {
        !self.done
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Closes every client, then the listener.
    pub fn close(&mut self, reactor: &Reactor) {
        for (fd, _) in self.clients.drain() {
            let _ = reactor.unbind(fd, None);
        }

        if let Some(listener) = self.listener.take() {
            let _ = reactor.unbind(listener.as_raw_fd(), None);
        }

        log::debug!("control server closed");
    }

    fn on_accept(this: &Rc<RefCell<Self>>, reactor: &Reactor) {
        loop {
            let engine = &mut *this.borrow_mut();
            let Some(listener) = &engine.listener else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }

                    log::debug!("control client connected: {peer}");

                    let fd = stream.as_raw_fd();
                    engine.clients.insert(fd, Client::new(stream));

                    let on_event = this.clone();
                    let bound = reactor.bind(
                        fd,
                        Interest::READABLE | Interest::ERROR,
                        move |reactor, fd, event| match event {
                            Event::Error => on_event.borrow_mut().drop_client(reactor, fd),
                            _ => Self::on_readable(&on_event, reactor, fd),
                        },
                    );

                    if bound.is_err() {
                        engine.clients.remove(&fd);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::warn!("control accept failed: {err}");
                    return;
                }
            }
        }
    }

    fn on_readable(this: &Rc<RefCell<Self>>, reactor: &Reactor, fd: RawFd) {
        let mut messages = Vec::new();
        let mut misbehaving = false;
        let mut disconnected = false;

        {
            let engine = &mut *this.borrow_mut();
            let Some(client) = engine.clients.get_mut(&fd) else {
                return;
            };

            let mut chunk = [0u8; RECV_CHUNK];
            match client.stream.read(&mut chunk) {
                Ok(0) => disconnected = true,
                Ok(count) => {
                    client.inbound.push(&chunk[..count]);

                    loop {
                        let mut txn = client.inbound.begin();
                        match control::decode(txn.stream()) {
                            Ok(message) => {
                                txn.commit();
                                messages.push(message);
                            }
                            Err(codec::Error::UnexpectedEof) => {
                                // Half a frame; put the bytes back and wait.
                                txn.abort();
                                break;
                            }
                            Err(
                                codec::Error::InvalidHostname | codec::Error::InvalidAddress,
                            ) => {
                                txn.commit();
                                misbehaving = true;
                                break;
                            }
                            Err(err) => {
                                // The frame was consumed, so commit carries
                                // the position past it and parsing resumes
                                // at the next one.
                                txn.commit();
                                log::debug!("skipping malformed control frame: {err}");
                            }
                        }
                    }

                    client.inbound.compact();
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => disconnected = true,
            }
        }

        if disconnected {
            this.borrow_mut().drop_client(reactor, fd);
            return;
        }

        let mut replies = Vec::new();
        {
            let mut engine = this.borrow_mut();
            for message in messages {
                if let Some(reply) = engine.dispatch(message) {
                    replies.push(reply);
                }
            }
        }

        {
            let engine = &mut *this.borrow_mut();
            let Some(client) = engine.clients.get_mut(&fd) else {
                return;
            };

            for reply in &replies {
                match control::encode(reply) {
                    Ok(bytes) => client.outbound.push(&bytes),
                    Err(err) => log::warn!("control reply rejected: {err}"),
                }
            }
        }

        Self::flush(this, reactor, fd);

        if misbehaving {
            log::debug!("dropping misbehaving control client");
            this.borrow_mut().drop_client(reactor, fd);
        }
    }

    fn on_writable(this: &Rc<RefCell<Self>>, reactor: &Reactor, fd: RawFd) {
        Self::flush(this, reactor, fd);
    }

    /// Pushes queued replies out, binding writable interest while a residue
    /// is pending and dropping it again once the queue drains.
    fn flush(this: &Rc<RefCell<Self>>, reactor: &Reactor, fd: RawFd) {
        let mut failed = false;

        {
            let engine = &mut *this.borrow_mut();
            let Some(client) = engine.clients.get_mut(&fd) else {
                return;
            };

            match client.outbound.flush(&mut client.stream) {
                Ok(true) => {
                    if client.write_bound {
                        client.write_bound = false;
                        let _ = reactor.unbind(fd, Some(Interest::WRITABLE));
                    }
                }
                Ok(false) => {
                    if !client.write_bound {
                        client.write_bound = true;

                        let on_event = this.clone();
                        let bound =
                            reactor.bind(fd, Interest::WRITABLE, move |reactor, fd, _| {
                                Self::on_writable(&on_event, reactor, fd);
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
            this.borrow_mut().drop_client(reactor, fd);
        }
    }

    fn drop_client(&mut self, reactor: &Reactor, fd: RawFd) {
        let _ = reactor.unbind(fd, None);
        self.clients.remove(&fd);
    }

    /// Routes one decoded request to the peer map. `None` means the request
    /// gets no reply.
    fn dispatch(&mut self, message: Message) -> Option<Message> {
        match message {
            Message::Host {
                hostname: Some(hostname),
            } => Some(Message::Ip {
                addrs: self.names.query_host(&hostname),
            }),
            Message::Ip { addrs } => {
                // A lookup carries exactly one address; anything else is
                // malformed and goes unanswered.
                if addrs.len() != 1 {
                    return None;
                }

                Some(Message::Host {
                    hostname: self.names.query_ip(addrs[0]),
                })
            }
            Message::GetAll => Some(Message::NameIpMapping {
                name_ips: self.names.snapshot(),
            }),
            Message::Quit => {
                log::info!("quit requested over the control socket");
                self.done = true;
                self.shutdown.trigger();
                None
            }
            Message::Host { hostname: None } | Message::NameIpMapping { .. } => None,
        }
    }
}
