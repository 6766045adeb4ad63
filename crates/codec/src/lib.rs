//! ## LAN Naming Service wire formats
//!
//! Everything that crosses a socket in lnsd is defined here: the fixed-size
//! UDP announce frame, the length-prefixed JSON control protocol spoken over
//! the loopback TCP socket, and the SOCKS5 handshake used by the `.lan`
//! proxy. The codecs all parse out of a [`stream::ByteStream`], whose
//! transactions let a caller speculatively read a frame and roll the buffer
//! back when the frame turns out to be incomplete.

pub mod announce;
pub mod control;
pub mod socks;
pub mod stream;

use std::net::Ipv4Addr;

#[derive(Debug)]
pub enum Error {
    /// The input ended before a complete frame could be read.
    UnexpectedEof,
    InvalidFrameSize(usize),
    InvalidHeader(u8),
    InvalidHostname,
    InvalidAddress,
    FrameTooLarge(usize),
    UnknownCommand(u8),
    UnknownAddressType(u8),
    UnsupportedVersion(u8),
    Json(serde_json::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Checks that a hostname is fit for the wire.
///
/// A hostname is non-empty, at most [`announce::FRAME_SIZE`] - 1 bytes, and
/// made of printable ASCII. Space and DEL are excluded so a name can never
/// smuggle padding or control characters into an announce frame.
///
/// # Test
///
/// ```
/// use lnsd_codec::verify_hostname;
///
/// assert!(verify_hostname("workbench").is_ok());
/// assert!(verify_hostname("").is_err());
/// assert!(verify_hostname("two words").is_err());
/// assert!(verify_hostname("\u{7f}").is_err());
/// ```
pub fn verify_hostname(hostname: &str) -> Result<(), Error> {
    if hostname.is_empty() || hostname.len() > announce::FRAME_SIZE - 1 {
        return Err(Error::InvalidHostname);
    }

    if !hostname.bytes().all(|byte| (33..=126).contains(&byte)) {
        return Err(Error::InvalidHostname);
    }

    Ok(())
}

/// Parses a textual IPv4 address, rejecting anything that is not four dotted
/// decimal octets in `[0, 255]`.
///
/// # Test
///
/// ```
/// use lnsd_codec::verify_ipv4;
///
/// assert!(verify_ipv4("192.168.0.7").is_ok());
/// assert!(verify_ipv4("1.2.3").is_err());
/// assert!(verify_ipv4("255.256.257.258").is_err());
/// ```
pub fn verify_ipv4(text: &str) -> Result<Ipv4Addr, Error> {
    text.parse().map_err(|_| Error::InvalidAddress)
}
