//! The loopback control protocol.
//!
//! Local programs query the daemon over TCP with length-prefixed JSON: a
//! two-byte little-endian length followed by an object whose `"type"` field
//! selects the message. The same five messages serve as requests and
//! replies:
//!
//! | `"type"` | payload | direction |
//! |---|---|---|
//! | `name` | `{hostname}` | hostname query, or reply to an IP lookup |
//! | `ip` | `{ip_addrs}` | IP query, or reply to a hostname lookup |
//! | `get-all` | `{}` | request the whole mapping |
//! | `nameipmapping` | `{name_ips}` | the whole mapping |
//! | `quit` | `{}` | terminate the daemon, no reply |
//!
//! Decoding distinguishes three failure classes because the server treats
//! them differently: [`Error::UnexpectedEof`] (frame still in flight, keep
//! the buffer), [`Error::Json`] (skip the frame), and the validation errors
//! (the client is misbehaving and gets dropped).

use std::{collections::HashMap, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::{Error, stream::ByteStream, verify_hostname, verify_ipv4};

/// A control request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Host { hostname: Option<String> },
    Ip { addrs: Vec<Ipv4Addr> },
    GetAll,
    NameIpMapping { name_ips: HashMap<String, Vec<Ipv4Addr>> },
    Quit,
}

/// The JSON shape of [`Message`]. Addresses stay textual here so that
/// validation failures surface as [`Error::InvalidAddress`] rather than as a
/// parse error inside serde.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum Wire {
    #[serde(rename = "name")]
    Host { hostname: Option<String> },
    #[serde(rename = "ip")]
    Ip { ip_addrs: Vec<String> },
    #[serde(rename = "get-all")]
    GetAll,
    #[serde(rename = "nameipmapping")]
    NameIpMapping { name_ips: HashMap<String, Vec<String>> },
    #[serde(rename = "quit")]
    Quit,
}

impl From<&Message> for Wire {
    fn from(message: &Message) -> Self {
        match message {
            Message::Host { hostname } => Wire::Host {
                hostname: hostname.clone(),
            },
            Message::Ip { addrs } => Wire::Ip {
                ip_addrs: addrs.iter().map(|addr| addr.to_string()).collect(),
            },
            Message::GetAll => Wire::GetAll,
            Message::NameIpMapping { name_ips } => Wire::NameIpMapping {
                name_ips: name_ips
                    .iter()
                    .map(|(name, addrs)| {
                        let addrs = addrs.iter().map(|addr| addr.to_string()).collect();
                        (name.clone(), addrs)
                    })
                    .collect(),
            },
            Message::Quit => Wire::Quit,
        }
    }
}

impl TryFrom<Wire> for Message {
    type Error = Error;

    fn try_from(wire: Wire) -> Result<Self, Error> {
        Ok(match wire {
            Wire::Host { hostname } => {
                if let Some(hostname) = &hostname {
                    verify_hostname(hostname)?;
                }

                Message::Host { hostname }
            }
            Wire::Ip { ip_addrs } => Message::Ip {
                addrs: ip_addrs
                    .iter()
                    .map(|text| verify_ipv4(text))
                    .collect::<Result<_, _>>()?,
            },
            Wire::GetAll => Message::GetAll,
            Wire::NameIpMapping { name_ips } => {
                let mut mapping = HashMap::with_capacity(name_ips.len());
                for (name, addrs) in name_ips {
                    verify_hostname(&name)?;
                    let addrs = addrs
                        .iter()
                        .map(|text| verify_ipv4(text))
                        .collect::<Result<_, _>>()?;
                    mapping.insert(name, addrs);
                }

                Message::NameIpMapping { name_ips: mapping }
            }
            Wire::Quit => Message::Quit,
        })
    }
}

/// Serializes a message with its length prefix. The length is always
/// little-endian on the wire, whatever the host order.
///
/// Hostname validation applies to everything but an explicit null reply.
///
/// # Test
///
/// ```
/// use lnsd_codec::control::{Message, encode};
///
/// let bytes = encode(&Message::Quit).unwrap();
/// let length = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
///
/// assert_eq!(length, bytes.len() - 2);
/// assert!(encode(&Message::Host { hostname: Some("".into()) }).is_err());
/// ```
pub fn encode(message: &Message) -> Result<Vec<u8>, Error> {
    match message {
        Message::Host {
            hostname: Some(hostname),
        } => verify_hostname(hostname)?,
        Message::NameIpMapping { name_ips } => {
            for name in name_ips.keys() {
                verify_hostname(name)?;
            }
        }
        _ => {}
    }

    let body = serde_json::to_vec(&Wire::from(message))?;
    if body.len() > u16::MAX as usize {
        return Err(Error::FrameTooLarge(body.len()));
    }

    let mut bytes = Vec::with_capacity(2 + body.len());
    bytes.extend_from_slice(&(body.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&body);

    Ok(bytes)
}

/// Reads one message off a stream: exactly two length bytes, then exactly
/// that many JSON bytes. Either read coming up short is
/// [`Error::UnexpectedEof`], which a server turns into an aborted
/// transaction until the rest of the frame arrives.
///
/// # Test
///
/// ```
/// use lnsd_codec::control::{Message, decode, encode};
/// use lnsd_codec::stream::ByteStream;
///
/// let mut stream = ByteStream::from(encode(&Message::GetAll).unwrap());
///
/// assert_eq!(decode(&mut stream).unwrap(), Message::GetAll);
/// ```
pub fn decode(stream: &mut ByteStream) -> Result<Message, Error> {
    let header = stream.read(2);
    if header.len() != 2 {
        return Err(Error::UnexpectedEof);
    }

    let length = u16::from_le_bytes([header[0], header[1]]) as usize;
    let body = stream.read(length);
    if body.len() != length {
        return Err(Error::UnexpectedEof);
    }

    Message::try_from(serde_json::from_slice::<Wire>(&body)?)
}
