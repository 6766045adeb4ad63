use std::{fs::read_to_string, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::Deserialize;

use service::{announce::NET_PORT, control::CONTROL_PORT};

const DEFAULT_CONFIG_FILE: &str = "/etc/lnsd.conf";

/// The `[lnsd]` section of the configuration file. Every field is optional;
/// an absent key falls through to the built-in default or the command line.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
struct Section {
    net_port: Option<u16>,
    control_port: Option<u16>,
    hostname: Option<String>,
    daemonize: Option<bool>,
    verbose: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct File {
    #[serde(default)]
    lnsd: Section,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "lnsd",
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Configuration file to load; command line options override it
    #[arg(short = 'c', value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Control and network ports as CTRL:NET
    #[arg(short = 'p', value_name = "CTRL:NET")]
    ports: Option<String>,

    /// The hostname to announce (default: the system hostname)
    #[arg(short = 'n', value_name = "NAME")]
    name: Option<String>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'D')]
    daemonize: bool,

    /// Log at debug level
    #[arg(short = 'v')]
    verbose: bool,
}

/// Fully resolved daemon settings.
///
/// Precedence is built-in default, then configuration file, then command
/// line; each recognized key is applied on its own, so setting one never
/// masks another.
#[derive(Debug, Clone)]
pub struct Config {
    pub hostname: String,
    pub control_port: u16,
    pub net_port: u16,
    pub daemonize: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: system_hostname(),
            control_port: CONTROL_PORT,
            net_port: NET_PORT,
            daemonize: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Loads settings from the command line and the configuration file. A
    /// missing file is only an error when `-c` named it explicitly.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = Config::default();

        let (path, explicit) = match &cli.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        match read_to_string(&path) {
            Ok(contents) => {
                let file: File = toml::from_str(&contents)
                    .with_context(|| format!("bad configuration file {}", path.display()))?;
                config.apply_section(file.lnsd)?;
            }
            Err(err) if explicit => {
                return Err(anyhow!("cannot read {}: {err}", path.display()));
            }
            Err(_) => {}
        }

        config.apply_cli(cli)?;

        codec::verify_hostname(&config.hostname)
            .map_err(|err| anyhow!("invalid hostname {:?}: {err}", config.hostname))?;

        Ok(config)
    }

    fn apply_section(&mut self, section: Section) -> Result<()> {
        if let Some(port) = section.net_port {
            self.net_port = check_port(port)?;
        }

        if let Some(port) = section.control_port {
            self.control_port = check_port(port)?;
        }

        if let Some(hostname) = section.hostname {
            self.hostname = hostname;
        }

        if let Some(daemonize) = section.daemonize {
            self.daemonize = daemonize;
        }

        if let Some(verbose) = section.verbose {
            self.verbose = verbose;
        }

        Ok(())
    }

    fn apply_cli(&mut self, cli: Cli) -> Result<()> {
        if let Some(ports) = &cli.ports {
            let (control, net) = parse_ports(ports)?;
            self.control_port = control;
            self.net_port = net;
        }

        if let Some(name) = cli.name {
            self.hostname = name;
        }

        if cli.daemonize {
            self.daemonize = true;
        }

        if cli.verbose {
            self.verbose = true;
        }

        Ok(())
    }
}

fn check_port(port: u16) -> Result<u16> {
    if port == 0 {
        bail!("port numbers must be between 1 and 65535");
    }

    Ok(port)
}

/// Splits a `CTRL:NET` port pair.
fn parse_ports(text: &str) -> Result<(u16, u16)> {
    let Some((control, net)) = text.split_once(':') else {
        bail!("expected CTRL:NET, got {text:?}");
    };

    let control = control
        .parse()
        .map_err(|_| anyhow!("invalid control port {control:?}"))?;
    let net = net
        .parse()
        .map_err(|_| anyhow!("invalid network port {net:?}"))?;

    Ok((check_port(control)?, check_port(net)?))
}

/// The kernel's idea of this machine's name, or "localhost" when it has
/// none.
fn system_hostname() -> String {
    let mut buffer = [0u8; 256];

    let result =
        unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
    if result != 0 {
        return "localhost".to_string();
    }

    let length = buffer.iter().position(|byte| *byte == 0).unwrap_or(0);
    match std::str::from_utf8(&buffer[..length]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}
