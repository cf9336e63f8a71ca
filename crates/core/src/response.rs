//! APDU response definitions
//!
//! A response APDU is a raw byte buffer of `data ‖ SW1 ‖ SW2`, at least
//! two bytes long, immutable once constructed.

use std::fmt;

use bytes::Bytes;

use crate::error::Error;

/// The two status word bytes terminating every response APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte
    pub sw1: u8,
    /// Second status byte
    pub sw2: u8,
}

impl StatusWord {
    /// Normal completion
    pub const SUCCESS: Self = Self::new(0x90, 0x00);

    /// Create a status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// The status word as a single 16-bit value
    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    /// Whether this is the normal completion status 0x9000
    pub const fn is_success(self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// SW1 = 0x61: SW2 more response bytes are waiting for GET RESPONSE
    pub const fn more_data_available(self) -> bool {
        self.sw1 == 0x61
    }

    /// SW1 = 0x6C: wrong Le, SW2 carries the correct one
    pub const fn wrong_length(self) -> bool {
        self.sw1 == 0x6C
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// A response APDU: payload data followed by SW1 and SW2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    bytes: Bytes,
}

impl Response {
    /// Parse a response from raw bytes; fails if shorter than SW1‖SW2
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_buffer(Bytes::copy_from_slice(bytes))
    }

    /// Take ownership of an already-received buffer
    pub fn from_buffer(bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::ResponseTooShort(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// The payload data, without the status word
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 2]
    }

    /// The status word
    pub fn status(&self) -> StatusWord {
        let n = self.bytes.len();
        StatusWord::new(self.bytes[n - 2], self.bytes[n - 1])
    }

    /// Whether the status word is 0x9000
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// The full raw buffer, data and status word
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Response> for Bytes {
    fn from(response: Response) -> Self {
        response.bytes
    }
}
