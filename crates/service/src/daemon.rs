//! The supervisor: wires the reactor and both engines together and runs the
//! daemon loop until the shutdown event or a quit command stops it.

use std::io;

use crate::{
    Shutdown,
    announce::{AnnounceEngine, AnnounceOptions},
    control::ControlEngine,
    names::NameTable,
    reactor::Reactor,
};

pub struct DaemonOptions {
    pub hostname: String,
    pub net_port: u16,
    pub control_port: u16,
}

/// The daemon core: announce engine, control engine, one reactor.
pub struct NamingDaemon {
    options: DaemonOptions,
    names: NameTable,
    shutdown: Shutdown,
}

impl NamingDaemon {
    pub fn new(options: DaemonOptions, shutdown: Shutdown) -> Self {
        Self {
            options,
            names: NameTable::new(),
            shutdown,
        }
    }

    /// The peer map handle, for readers on other threads (the SOCKS
    /// resolver).
    pub fn names(&self) -> NameTable {
        self.names.clone()
    }

    /// Runs until the control engine handles a quit or the shutdown event
    /// fires. Engines close in reverse construction order on the way out,
    /// and the shutdown event is left triggered so sibling threads drain.
    pub fn run(&self) -> io::Result<()> {
        let reactor = Reactor::new()?;

        let announce = AnnounceEngine::open(
            &reactor,
            AnnounceOptions {
                port: self.options.net_port,
                ..AnnounceOptions::new(self.options.hostname.clone())
            },
            self.names.clone(),
        )?;

        let control = ControlEngine::open(
            &reactor,
            self.options.control_port,
            self.names.clone(),
            self.shutdown.clone(),
        )?;

        log::info!(
            "lnsd running: hostname={}, net-port={}, control-port={}",
            self.options.hostname,
            self.options.net_port,
            self.options.control_port
        );

        let result = loop {
            if !control.borrow().is_running() || self.shutdown.is_set() {
                break Ok(());
            }

            let timeout = announce.borrow().time_until_next_announce();
            if let Err(err) = reactor.poll(Some(timeout)) {
                break Err(err);
            }
        };

        control.borrow_mut().close(&reactor);
        announce.borrow_mut().close(&reactor);
        self.shutdown.trigger();

        result
    }
}
