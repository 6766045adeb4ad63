#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{process, sync::OnceLock};

use lnsd::{config::Config, daemonize};
use service::Shutdown;

static SHUTDOWN: OnceLock<Shutdown> = OnceLock::new();

extern "C" fn on_terminate(_signal: libc::c_int) {
    if let Some(shutdown) = SHUTDOWN.get() {
        shutdown.trigger();
    }
}

fn install_signal_handlers() {
    let handler = on_terminate as extern "C" fn(libc::c_int);

    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("lnsd: {err}");
            return 1;
        }
    };

    let level = if config.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };

    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("lnsd: {err}");
        return 2;
    }

    let shutdown = Shutdown::new();
    let _ = SHUTDOWN.set(shutdown.clone());
    install_signal_handlers();

    if config.daemonize {
        if let Err(err) = daemonize::daemonize() {
            log::error!("failed to detach: {err}");
            return 2;
        }
    }

    match lnsd::startup(config, shutdown) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("fatal: {err}");
            2
        }
    }
}
