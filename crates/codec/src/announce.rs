//! The UDP broadcast frame.
//!
//! An announce is the only message on the network channel: a fixed 512-byte
//! datagram that declares the sender's hostname. Peers record the sender
//! address and hostname as they hear it; there is no reply. The frame is a
//! single header byte followed by the ASCII hostname padded with NUL to fill
//! the datagram.

use crate::{Error, verify_hostname};

/// Announce frames are exactly this many bytes on the wire, not counting the
/// UDP header.
pub const FRAME_SIZE: usize = 512;

const HEADER: u8 = 0x01;

/// A periodic hostname declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    hostname: String,
}

impl Announce {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Serializes the frame, rejecting hostnames that cannot go on the wire.
    ///
    /// # Test
    ///
    /// ```
    /// use lnsd_codec::announce::{Announce, FRAME_SIZE};
    ///
    /// let frame = Announce::new("workbench").encode().unwrap();
    ///
    /// assert_eq!(frame.len(), FRAME_SIZE);
    /// assert_eq!(frame[0], 0x01);
    /// assert_eq!(&frame[1..10], b"workbench");
    /// assert_eq!(frame[10], 0x00);
    /// ```
    pub fn encode(&self) -> Result<[u8; FRAME_SIZE], Error> {
        verify_hostname(&self.hostname)?;

        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = HEADER;
        frame[1..1 + self.hostname.len()].copy_from_slice(self.hostname.as_bytes());

        Ok(frame)
    }

    /// Parses a frame, verifying its size, header byte and hostname. The
    /// hostname runs up to the first NUL, or through the whole tail if the
    /// padding is absent.
    ///
    /// # Test
    ///
    /// ```
    /// use lnsd_codec::announce::Announce;
    ///
    /// let frame = Announce::new("workbench").encode().unwrap();
    /// let message = Announce::decode(&frame).unwrap();
    ///
    /// assert_eq!(message.hostname(), "workbench");
    /// ```
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() != FRAME_SIZE {
            return Err(Error::InvalidFrameSize(frame.len()));
        }

        if frame[0] != HEADER {
            return Err(Error::InvalidHeader(frame[0]));
        }

        let tail = &frame[1..];
        let hostname = match tail.iter().position(|byte| *byte == 0) {
            Some(first_nul) => &tail[..first_nul],
            None => tail,
        };

        let hostname = std::str::from_utf8(hostname).map_err(|_| Error::InvalidHostname)?;
        verify_hostname(hostname)?;

        Ok(Self::new(hostname))
    }
}
