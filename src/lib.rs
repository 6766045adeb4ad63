pub mod config;
pub mod daemonize;
pub mod proxy;

use std::thread;

use service::{
    Shutdown,
    daemon::{DaemonOptions, NamingDaemon},
};

use self::config::Config;

/// Starts the daemon core and the SOCKS proxy and blocks until both are
/// done. Opened as a function so integration consumers can run a daemon
/// without going through the binary.
pub fn startup(config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let daemon = NamingDaemon::new(
        DaemonOptions {
            hostname: config.hostname,
            net_port: config.net_port,
            control_port: config.control_port,
        },
        shutdown.clone(),
    );

    let names = daemon.names();
    let proxy_shutdown = shutdown.clone();
    let proxy = thread::Builder::new()
        .name("socks-proxy".into())
        .spawn(move || {
            if let Err(err) = proxy::run(names, proxy::SOCKS_PORT, proxy_shutdown) {
                log::error!("socks proxy failed: {err}");
            }
        })?;

    let result = daemon.run();

    // Whatever ended the core also ends the proxy thread.
    shutdown.trigger();
    let _ = proxy.join();

    Ok(result?)
}
