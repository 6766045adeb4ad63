//! Readiness backends.
//!
//! Three implementations of the same small contract: epoll where available,
//! `poll(2)` for the rest of POSIX, and a `select(2)` fallback. The reactor
//! treats them interchangeably; the fallback exists for hosts whose poll
//! support is broken or absent, and has to emulate one quirk itself (see
//! [`SelectPoller::wait`]).

use std::{io, os::fd::RawFd, thread, time::Duration};

use super::Interest;

pub(crate) fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Converts a float-second timeout into the millisecond form epoll and poll
/// take. Sub-millisecond waits round up so a short timeout never degrades
/// into a busy spin.
fn as_millis(timeout: Option<f64>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(seconds) => (seconds * 1000.0).ceil().min(i32::MAX as f64) as libc::c_int,
    }
}

pub(crate) trait Poller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks for at most `timeout` seconds (`None` means indefinitely) and
    /// appends the ready descriptors to `ready`. An interrupted wait is not
    /// an error; it reports no events so the caller can re-check its state.
    fn wait(&mut self, timeout: Option<f64>, ready: &mut Vec<(RawFd, Interest)>)
    -> io::Result<()>;
}

/// Which backend a reactor multiplexes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    Poll,
    Select,
}

impl Backend {
    pub(crate) fn create(self) -> io::Result<Box<dyn Poller>> {
        Ok(match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Box::new(EpollPoller::new()?),
            Backend::Poll => Box::new(PollPoller::default()),
            Backend::Select => Box::new(SelectPoller::default()),
        })
    }

    /// The preferred backend for the running platform.
    pub(crate) fn platform_default() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            Backend::Epoll
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Backend::Poll
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct EpollPoller {
    epfd: RawFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl EpollPoller {
    fn new() -> io::Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self { epfd })
    }

    fn event(fd: RawFd, interest: Interest) -> libc::epoll_event {
        let mut events = 0u32;
        if interest.contains(super::Event::Readable) {
            events |= libc::EPOLLIN as u32;
        }
        if interest.contains(super::Event::Writable) {
            events |= libc::EPOLLOUT as u32;
        }

        libc::epoll_event {
            events,
            u64: fd as u64,
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = Self::event(fd, interest);
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) })?;
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Poller for EpollPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::default())
    }

    fn wait(
        &mut self,
        timeout: Option<f64>,
        ready: &mut Vec<(RawFd, Interest)>,
    ) -> io::Result<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 256];

        let count = match cvt(unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                as_millis(timeout),
            )
        }) {
            Ok(count) => count as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        for event in &events[..count] {
            let mut interest = Interest::default();
            if event.events & libc::EPOLLIN as u32 != 0 {
                interest = interest | Interest::READABLE;
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                interest = interest | Interest::WRITABLE;
            }
            if event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                interest = interest | Interest::ERROR;
            }

            if !interest.is_empty() {
                ready.push((event.u64 as RawFd, interest));
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct PollPoller {
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    fn events(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.contains(super::Event::Readable) {
            events |= libc::POLLIN;
        }
        if interest.contains(super::Event::Writable) {
            events |= libc::POLLOUT;
        }

        events
    }
}

impl Poller for PollPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: Self::events(interest),
            revents: 0,
        });

        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        for entry in self.fds.iter_mut() {
            if entry.fd == fd {
                entry.events = Self::events(interest);
                return Ok(());
            }
        }

        Err(io::Error::from(io::ErrorKind::NotFound))
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|entry| entry.fd != fd);
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Option<f64>,
        ready: &mut Vec<(RawFd, Interest)>,
    ) -> io::Result<()> {
        let count = match cvt(unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                as_millis(timeout),
            )
        }) {
            Ok(count) => count as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        if count == 0 {
            return Ok(());
        }

        for entry in &self.fds {
            if entry.revents == 0 {
                continue;
            }

            let mut interest = Interest::default();
            if entry.revents & libc::POLLIN != 0 {
                interest = interest | Interest::READABLE;
            }
            if entry.revents & libc::POLLOUT != 0 {
                interest = interest | Interest::WRITABLE;
            }
            if entry.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                interest = interest | Interest::ERROR;
            }

            if !interest.is_empty() {
                ready.push((entry.fd, interest));
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct SelectPoller {
    fds: Vec<(RawFd, Interest)>,
}

impl Poller for SelectPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.fds.push((fd, interest));
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        for entry in self.fds.iter_mut() {
            if entry.0 == fd {
                entry.1 = interest;
                return Ok(());
            }
        }

        Err(io::Error::from(io::ErrorKind::NotFound))
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|entry| entry.0 != fd);
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Option<f64>,
        ready: &mut Vec<(RawFd, Interest)>,
    ) -> io::Result<()> {
        // select rejects empty descriptor sets on some hosts, so with
        // nothing registered the timed wait becomes a plain sleep. Step
        // callbacks still run because the reactor runs them after every
        // wait, whatever it returned.
        if self.fds.is_empty() {
            if let Some(seconds) = timeout {
                thread::sleep(Duration::from_secs_f64(seconds));
            }

            return Ok(());
        }

        let mut readers: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writers: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut errors: libc::fd_set = unsafe { std::mem::zeroed() };

        let mut max_fd = 0;
        for (fd, interest) in &self.fds {
            max_fd = max_fd.max(*fd);

            unsafe {
                if interest.contains(super::Event::Readable) {
                    libc::FD_SET(*fd, &mut readers);
                }
                if interest.contains(super::Event::Writable) {
                    libc::FD_SET(*fd, &mut writers);
                }
                if interest.contains(super::Event::Error) {
                    libc::FD_SET(*fd, &mut errors);
                }
            }
        }

        let mut tv;
        let tv_ptr = match timeout {
            None => std::ptr::null_mut(),
            Some(seconds) => {
                tv = libc::timeval {
                    tv_sec: seconds.trunc() as libc::time_t,
                    tv_usec: (seconds.fract() * 1_000_000.0) as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
        };

        match cvt(unsafe {
            libc::select(max_fd + 1, &mut readers, &mut writers, &mut errors, tv_ptr)
        }) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for (fd, _) in &self.fds {
            let mut interest = Interest::default();

            unsafe {
                if libc::FD_ISSET(*fd, &readers) {
                    interest = interest | Interest::READABLE;
                }
                if libc::FD_ISSET(*fd, &writers) {
                    interest = interest | Interest::WRITABLE;
                }
                if libc::FD_ISSET(*fd, &errors) {
                    interest = interest | Interest::ERROR;
                }
            }

            if !interest.is_empty() {
                ready.push((*fd, interest));
            }
        }

        Ok(())
    }
}
