//! SOCKS5 wire format, as much of it as the `.lan` proxy speaks.
//!
//! [RFC1928]: https://tools.ietf.org/html/rfc1928
//!
//! The proxy only advertises NO AUTHENTICATION, so the handshake is the
//! method-selection greeting, one request (CONNECT, BIND or UDP ASSOCIATE),
//! and a reply per state transition. UDP ASSOCIATE datagrams carry their own
//! header, parsed here as well. Requests decode out of a
//! [`ByteStream`] so a server can wait for the rest of a half-received
//! handshake without consuming it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{Error, stream::ByteStream};

pub const VERSION: u8 = 0x05;

/// Method-selection: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method-selection: none of the offered methods is acceptable.
pub const METHOD_UNACCEPTABLE: u8 = 0xff;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// The client's opening message: the list of auth methods it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub fn decode(stream: &mut ByteStream) -> Result<Self, Error> {
        let header = stream.read(2);
        if header.len() != 2 {
            return Err(Error::UnexpectedEof);
        }

        if header[0] != VERSION {
            return Err(Error::UnsupportedVersion(header[0]));
        }

        let count = header[1] as usize;
        let methods = stream.read(count);
        if methods.len() != count {
            return Err(Error::UnexpectedEof);
        }

        Ok(Self { methods })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x01 => Self::Connect,
            0x02 => Self::Bind,
            0x03 => Self::UdpAssociate,
            other => return Err(Error::UnknownCommand(other)),
        })
    }
}

/// A request or datagram destination before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

fn decode_target(stream: &mut ByteStream, kind: u8) -> Result<TargetAddr, Error> {
    Ok(match kind {
        ADDR_IPV4 => {
            let bytes = stream.read(4);
            let octets: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::UnexpectedEof)?;

            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_IPV6 => {
            let bytes = stream.read(16);
            let octets: [u8; 16] =
                bytes.as_slice().try_into().map_err(|_| Error::UnexpectedEof)?;

            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        ADDR_DOMAIN => {
            let length = stream.read(1);
            if length.is_empty() {
                return Err(Error::UnexpectedEof);
            }

            let bytes = stream.read(length[0] as usize);
            if bytes.len() != length[0] as usize {
                return Err(Error::UnexpectedEof);
            }

            let domain = String::from_utf8(bytes).map_err(|_| Error::InvalidAddress)?;

            TargetAddr::Domain(domain)
        }
        other => return Err(Error::UnknownAddressType(other)),
    })
}

fn decode_port(stream: &mut ByteStream) -> Result<u16, Error> {
    let bytes = stream.read(2);
    if bytes.len() != 2 {
        return Err(Error::UnexpectedEof);
    }

    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// The request following a successful greeting.
///
/// # Test
///
/// ```
/// use lnsd_codec::socks::{Command, Request, TargetAddr};
/// use lnsd_codec::stream::ByteStream;
///
/// let mut stream = ByteStream::from(&[5u8, 1, 0, 3, 7, b'b', b'o', b'x', b'.', b'l', b'a', b'n', 0, 80][..]);
/// let request = Request::decode(&mut stream).unwrap();
///
/// assert_eq!(request.command, Command::Connect);
/// assert_eq!(request.addr, TargetAddr::Domain("box.lan".into()));
/// assert_eq!(request.port, 80);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub addr: TargetAddr,
    pub port: u16,
}

impl Request {
    pub fn decode(stream: &mut ByteStream) -> Result<Self, Error> {
        let header = stream.read(4);
        if header.len() != 4 {
            return Err(Error::UnexpectedEof);
        }

        if header[0] != VERSION {
            return Err(Error::UnsupportedVersion(header[0]));
        }

        Ok(Self {
            command: Command::try_from(header[1])?,
            addr: decode_target(stream, header[3])?,
            port: decode_port(stream)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
}

/// A server reply: status code plus the bound or connected address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub addr: SocketAddr,
}

impl Reply {
    /// An error reply; the address field carries zeros because there is no
    /// bound socket to report.
    pub fn failure(code: ReplyCode) -> Self {
        Self {
            code,
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![VERSION, self.code as u8, 0x00];

        match self.addr {
            SocketAddr::V4(addr) => {
                bytes.push(ADDR_IPV4);
                bytes.extend_from_slice(&addr.ip().octets());
            }
            SocketAddr::V6(addr) => {
                bytes.push(ADDR_IPV6);
                bytes.extend_from_slice(&addr.ip().octets());
            }
        }

        bytes.extend_from_slice(&self.addr.port().to_be_bytes());
        bytes
    }
}

/// The header prefixed to every datagram of a UDP association. After a
/// successful decode the stream position sits at the start of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub addr: TargetAddr,
    pub port: u16,
}

impl UdpHeader {
    pub fn decode(stream: &mut ByteStream) -> Result<Self, Error> {
        let header = stream.read(4);
        if header.len() != 4 {
            return Err(Error::UnexpectedEof);
        }

        Ok(Self {
            frag: header[2],
            addr: decode_target(stream, header[3])?,
            port: decode_port(stream)?,
        })
    }
}
