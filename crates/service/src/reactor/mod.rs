//! A single-threaded readiness reactor.
//!
//! The reactor watches raw file descriptors through one of the platform
//! backends in [`poller`] and invokes a callback per descriptor and event.
//! Callbacks receive the reactor itself, so an accept handler can register
//! the connection it just produced while dispatch is still in flight.
//! *Step callbacks* run once after every poll and carry the periodic
//! maintenance work (the announce heartbeat and TTL sweep).
//!
//! Dispatch and registration may interleave freely: a callback that unbinds
//! a descriptor later in the same batch simply causes that descriptor's
//! lookup to come up empty, which is a tolerated no-op. The only rule is
//! that callbacks must not re-enter [`Reactor::poll`].

mod poller;

pub use poller::Backend;

use std::{cell::RefCell, io, os::fd::RawFd, rc::Rc};

use ahash::{HashMap, HashMapExt};

pub(crate) use poller::cvt;
use poller::Poller;

/// A readiness event on a bound descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable,
    Writable,
    Error,
}

impl Event {
    const ALL: [Event; 3] = [Event::Readable, Event::Writable, Event::Error];

    fn index(self) -> usize {
        match self {
            Event::Readable => 0,
            Event::Writable => 1,
            Event::Error => 2,
        }
    }
}

/// A set of [`Event`]s a binding cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(1 << 0);
    pub const WRITABLE: Interest = Interest(1 << 1);
    pub const ERROR: Interest = Interest(1 << 2);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, event: Event) -> bool {
        self.0 & Interest::from_event(event).0 != 0
    }

    const fn from_event(event: Event) -> Interest {
        match event {
            Event::Readable => Interest::READABLE,
            Event::Writable => Interest::WRITABLE,
            Event::Error => Interest::ERROR,
        }
    }

    const fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl From<Event> for Interest {
    fn from(event: Event) -> Self {
        Interest::from_event(event)
    }
}

type Callback = Rc<RefCell<dyn FnMut(&Reactor, RawFd, Event)>>;
type StepCallback = Rc<RefCell<dyn FnMut(&Reactor)>>;

struct Registration {
    interest: Interest,
    callbacks: [Option<Callback>; 3],
}

/// The readiness multiplexer every engine in the daemon runs on.
pub struct Reactor {
    poller: RefCell<Box<dyn Poller>>,
    registry: RefCell<HashMap<RawFd, Registration>>,
    steps: RefCell<Vec<StepCallback>>,
}

impl Reactor {
    /// A reactor on the platform's preferred backend: epoll on Linux,
    /// `poll(2)` elsewhere.
    pub fn new() -> io::Result<Self> {
        Self::with_backend(Backend::platform_default())
    }

    pub fn with_backend(backend: Backend) -> io::Result<Self> {
        Ok(Self {
            poller: RefCell::new(backend.create()?),
            registry: RefCell::new(HashMap::new()),
            steps: RefCell::new(Vec::new()),
        })
    }

    /// Binds a callback for one or more events on a descriptor.
    ///
    /// Binding is additive: registering a descriptor for `READABLE` and then
    /// again for `WRITABLE` watches both, with each event keeping the
    /// callback it was bound with.
    pub fn bind<F>(&self, fd: RawFd, interest: Interest, callback: F) -> io::Result<()>
    where
        F: FnMut(&Reactor, RawFd, Event) + 'static,
    {
        let callback: Callback = Rc::new(RefCell::new(callback));
        let mut registry = self.registry.borrow_mut();

        match registry.get_mut(&fd) {
            Some(registration) => {
                let combined = registration.interest | interest;
                self.poller.borrow_mut().modify(fd, combined)?;
                registration.interest = combined;

                for event in Event::ALL {
                    if interest.contains(event) {
                        registration.callbacks[event.index()] = Some(callback.clone());
                    }
                }
            }
            None => {
                self.poller.borrow_mut().register(fd, interest)?;

                let mut callbacks: [Option<Callback>; 3] = [None, None, None];
                for event in Event::ALL {
                    if interest.contains(event) {
                        callbacks[event.index()] = Some(callback.clone());
                    }
                }

                registry.insert(fd, Registration { interest, callbacks });
            }
        }

        Ok(())
    }

    /// Drops interest in a descriptor, or in a subset of its events. When no
    /// interest remains the descriptor leaves the underlying poller
    /// entirely. Unbinding an unknown descriptor is a no-op.
    pub fn unbind(&self, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut registry = self.registry.borrow_mut();
        let Some(registration) = registry.get_mut(&fd) else {
            return Ok(());
        };

        let removed = interest.unwrap_or(registration.interest);
        let remaining = registration.interest.without(removed);

        if remaining.is_empty() {
            self.poller.borrow_mut().unregister(fd)?;
            registry.remove(&fd);
        } else {
            self.poller.borrow_mut().modify(fd, remaining)?;
            registration.interest = remaining;

            for event in Event::ALL {
                if removed.contains(event) {
                    registration.callbacks[event.index()] = None;
                }
            }
        }

        Ok(())
    }

    /// Adds a function that runs once after every [`Reactor::poll`],
    /// whatever the poll produced.
    pub fn add_step_callback<F>(&self, callback: F)
    where
        F: FnMut(&Reactor) + 'static,
    {
        self.steps.borrow_mut().push(Rc::new(RefCell::new(callback)));
    }

    /// Whether any descriptor is currently bound.
    pub fn has_clients(&self) -> bool {
        !self.registry.borrow().is_empty()
    }

    /// Waits for events and dispatches them.
    ///
    /// `None` or a negative timeout waits indefinitely, zero returns
    /// immediately, a positive value waits at most that many seconds. Per
    /// descriptor, readable dispatches before writable before error, so
    /// pending data is consumed before a close surfaces as a write error.
    pub fn poll(&self, timeout: Option<f64>) -> io::Result<()> {
        let timeout = timeout.filter(|seconds| *seconds >= 0.0);

        let mut ready = Vec::new();
        self.poller.borrow_mut().wait(timeout, &mut ready)?;

        for (fd, events) in ready {
            for event in Event::ALL {
                if !events.contains(event) {
                    continue;
                }

                let callback = self
                    .registry
                    .borrow()
                    .get(&fd)
                    .and_then(|registration| registration.callbacks[event.index()].clone());

                if let Some(callback) = callback {
                    (&mut *callback.borrow_mut())(self, fd, event);
                }
            }
        }

        let steps: Vec<StepCallback> = self.steps.borrow().clone();
        for step in steps {
            (&mut *step.borrow_mut())(self);
        }

        Ok(())
    }
}

/// An outbound buffer for readiness-driven writers.
///
/// Engines queue whole replies here and flush opportunistically; when a
/// flush would block they keep the residue and watch the socket for
/// [`Event::Writable`] until it drains.
///
/// # Test
///
/// ```
/// use lnsd_service::reactor::SendQueue;
///
/// let mut queue = SendQueue::default();
/// queue.push(b"hello");
///
/// let mut sink = Vec::new();
/// assert!(queue.flush(&mut sink).unwrap());
/// assert_eq!(sink, b"hello");
/// assert!(queue.is_empty());
/// ```
#[derive(Default)]
pub struct SendQueue {
    buffer: Vec<u8>,
    offset: usize,
}

impl SendQueue {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.buffer.len()
    }

    /// Writes as much queued data as the sink accepts. Returns `Ok(true)`
    /// once the queue is drained and `Ok(false)` when the sink would block.
    pub fn flush<W: io::Write>(&mut self, sink: &mut W) -> io::Result<bool> {
        while self.offset < self.buffer.len() {
            match sink.write(&self.buffer[self.offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => self.offset += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        self.buffer.clear();
        self.offset = 0;

        Ok(true)
    }
}
