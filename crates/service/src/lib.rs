//! ## The lnsd daemon core
//!
//! A single reactor thread drives everything the daemon does: the UDP
//! announce engine that broadcasts this host's name and collects everyone
//! else's, and the loopback TCP control engine that answers queries about
//! the resulting map. The [`daemon::NamingDaemon`] supervisor wires the two
//! together and runs until its [`Shutdown`] event fires.
//!
//! The peer map itself lives in [`names::NameTable`], the one structure
//! shared across threads; the SOCKS proxy reads it from its own reactor
//! thread when it resolves `.lan` names.

pub mod announce;
pub mod control;
pub mod daemon;
pub mod names;
pub mod reactor;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A process-wide one-shot termination event.
///
/// Set by the control protocol's quit command, by the signal handlers in the
/// foreground daemon, or by a fatal startup error. Every polling loop checks
/// it between iterations, so triggering it drains the process within one
/// poll timeout.
#[derive(Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
