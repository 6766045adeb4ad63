//! lns-query: the command-line face of the control protocol.
//!
//! Prints lookup results to stdout and nothing at all when a lookup comes
//! up empty. Exit status: 0 on success, 1 for usage errors, an unreachable
//! server or a miss, 2 when the protocol itself fails.

use std::process;

use clap::Parser;
use sdk::Client;
use service::control::CONTROL_PORT;

#[derive(Parser, Debug)]
#[command(
    name = "lns-query",
    about = "Query a running lnsd daemon.",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Print every known address and hostname pair
    #[arg(short = 'a', conflicts_with_all = ["ip", "name", "quit"])]
    all: bool,

    /// Print the hostname announced by an IP address
    #[arg(short = 'i', value_name = "IP", conflicts_with_all = ["name", "quit"])]
    ip: Option<String>,

    /// Print the IP addresses announcing a hostname
    #[arg(short = 'n', value_name = "NAME", conflicts_with = "quit")]
    name: Option<String>,

    /// Terminate the server
    #[arg(short = 'q')]
    quit: bool,

    /// The control port to connect to
    #[arg(short = 'p', value_name = "CTRL", default_value_t = CONTROL_PORT)]
    port: u16,
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { 1 } else { 0 };
        }
    };

    if !cli.all && cli.ip.is_none() && cli.name.is_none() && !cli.quit {
        eprintln!("lns-query: one of -a, -i, -n, -q is required");
        return 1;
    }

    // Arguments are validated before the daemon is bothered with them.
    let ip = match &cli.ip {
        Some(text) => match codec::verify_ipv4(text) {
            Ok(addr) => Some(addr),
            Err(err) => {
                eprintln!("lns-query: invalid IP address {text:?}: {err}");
                return 1;
            }
        },
        None => None,
    };

    if let Some(name) = &cli.name {
        if let Err(err) = codec::verify_hostname(name) {
            eprintln!("lns-query: invalid hostname {name:?}: {err}");
            return 1;
        }
    }

    let mut client = match Client::connect(cli.port) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("lns-query: cannot reach the server on port {}: {err}", cli.port);
            return 1;
        }
    };

    let result = if cli.all {
        client.mapping().map(|mapping| {
            for (hostname, addrs) in mapping {
                for addr in addrs {
                    println!("{addr} {hostname}");
                }
            }

            0
        })
    } else if let Some(addr) = ip {
        client.lookup_ip(addr).map(|hostname| match hostname {
            Some(hostname) => {
                println!("{hostname}");
                0
            }
            None => 1,
        })
    } else if let Some(name) = cli.name {
        client.lookup_host(&name).map(|addrs| {
            if addrs.is_empty() {
                return 1;
            }

            for addr in addrs {
                println!("{addr}");
            }

            0
        })
    } else {
        client.quit().map(|_| 0)
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("lns-query: {err}");
            2
        }
    }
}
