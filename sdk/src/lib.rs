//! # lnsd client SDK
//!
//! A blocking client for the lnsd control protocol: length-prefixed JSON
//! over the daemon's loopback TCP port. One connection serves any number of
//! request/reply pairs, so a [`Client`] can be held open and queried
//! repeatedly.
//!
//! ```no_run
//! use lnsd_sdk::Client;
//!
//! # fn example() -> Result<(), lnsd_sdk::Error> {
//! let mut client = Client::connect(10771)?;
//!
//! // Who is "box"?
//! for addr in client.lookup_host("box")? {
//!     println!("{addr}");
//! }
//!
//! // Who owns 192.168.1.7?
//! if let Some(hostname) = client.lookup_ip("192.168.1.7".parse().unwrap())? {
//!     println!("{hostname}");
//! }
//!
//! // The whole mapping.
//! for (hostname, addrs) in client.mapping()? {
//!     println!("{hostname}: {addrs:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpStream},
};

use codec::control::{Message, decode, encode};
use codec::stream::ByteStream;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codec(codec::Error),
    /// The server answered with a message the request does not pair with.
    UnexpectedReply,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

/// One blocking connection to a daemon's control port.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Connects to the daemon on the local host.
    pub fn connect(port: u16) -> Result<Self, Error> {
        Ok(Self {
            stream: TcpStream::connect(("127.0.0.1", port))?,
        })
    }

    /// Every IP address currently claiming `hostname`; empty when none does.
    pub fn lookup_host(&mut self, hostname: &str) -> Result<Vec<Ipv4Addr>, Error> {
        let reply = self.roundtrip(&Message::Host {
            hostname: Some(hostname.to_owned()),
        })?;

        match reply {
            Message::Ip { addrs } => Ok(addrs),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// The hostname `addr` last announced, if the daemon still considers it
    /// alive.
    pub fn lookup_ip(&mut self, addr: Ipv4Addr) -> Result<Option<String>, Error> {
        let reply = self.roundtrip(&Message::Ip { addrs: vec![addr] })?;

        match reply {
            Message::Host { hostname } => Ok(hostname),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// The whole name-to-addresses mapping.
    pub fn mapping(&mut self) -> Result<HashMap<String, Vec<Ipv4Addr>>, Error> {
        let reply = self.roundtrip(&Message::GetAll)?;

        match reply {
            Message::NameIpMapping { name_ips } => Ok(name_ips),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Asks the daemon to terminate. Quit has no reply.
    pub fn quit(&mut self) -> Result<(), Error> {
        self.send(&Message::Quit)
    }

    fn send(&mut self, message: &Message) -> Result<(), Error> {
        self.stream.write_all(&encode(message)?)?;
        Ok(())
    }

    fn roundtrip(&mut self, message: &Message) -> Result<Message, Error> {
        self.send(message)?;

        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header)?;

        let length = u16::from_le_bytes(header) as usize;
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body)?;

        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&body);

        Ok(decode(&mut ByteStream::from(bytes))?)
    }
}
