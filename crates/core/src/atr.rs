//! Answer-To-Reset (ATR) structural decoding
//!
//! The ATR is the byte sequence a card sends on power-up, described by
//! ISO/IEC 7816-3: a convention byte TS, a format byte T0, zero or more
//! groups of interface bytes (TA/TB/TC/TD), historical bytes, and an
//! optional checksum TCK. This module decodes the structure only; it does
//! not interpret interface byte contents.

use bytes::Bytes;

use crate::error::Error;

/// Bit-order convention signalled by TS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// TS = 0x3B
    Direct,
    /// TS = 0x3F
    Inverse,
}

/// Interface-byte window identifying a contactless card (PC/SC part 3)
const CONTACTLESS_INTERFACE: [u8; 2] = [0x80, 0x01];

/// A decoded Answer-To-Reset.
///
/// All derived fields are computed once at construction from the immutable
/// input bytes; accessors return sub-slices of the original buffer.
#[derive(Debug, Clone)]
pub struct Atr {
    bytes: Bytes,
    convention: Convention,
    /// End of the interface-byte window; interface bytes are `bytes[2..interface_end]`
    interface_end: usize,
    /// Offset of the first historical byte
    historical_offset: usize,
    /// Number of historical bytes (K, from the low nibble of T0)
    historical_len: usize,
    checksum: Option<u8>,
    contactless: bool,
}

impl Atr {
    /// Decode an ATR from its raw bytes
    pub fn parse(input: &[u8]) -> Result<Self, Error> {
        let bytes = Bytes::copy_from_slice(input);

        if bytes.len() < 2 {
            return Err(Error::Atr("shorter than TS and T0"));
        }

        let convention = match bytes[0] {
            0x3B => Convention::Direct,
            0x3F => Convention::Inverse,
            _ => return Err(Error::Atr("TS is neither 0x3B nor 0x3F")),
        };

        let t0 = bytes[1];
        let historical_len = (t0 & 0x0F) as usize;

        // Walk the interface byte groups. The high nibble of T0 (and of
        // each subsequent TDi) says which of TA/TB/TC/TD follow.
        let mut idx = 2usize;
        let mut presence = t0 >> 4;
        loop {
            let mut next_td = None;
            for bit in [0x1u8, 0x2, 0x4, 0x8] {
                if presence & bit == 0 {
                    continue;
                }
                if idx >= bytes.len() {
                    return Err(Error::Atr("truncated interface bytes"));
                }
                if bit == 0x8 {
                    next_td = Some(bytes[idx]);
                }
                idx += 1;
            }
            match next_td {
                Some(td) => presence = td >> 4,
                None => break,
            }
        }

        let interface_end = idx;
        if idx + historical_len > bytes.len() {
            return Err(Error::Atr("truncated historical bytes"));
        }

        let checksum = bytes.get(idx + historical_len).copied();
        let contactless = bytes[2..interface_end] == CONTACTLESS_INTERFACE;

        Ok(Self {
            bytes,
            convention,
            interface_end,
            historical_offset: idx,
            historical_len,
            checksum,
            contactless,
        })
    }

    /// The raw ATR bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The bit-order convention signalled by TS
    pub const fn convention(&self) -> Convention {
        self.convention
    }

    /// The interface bytes (TA/TB/TC/TD groups), excluding TS and T0
    pub fn interface_bytes(&self) -> &[u8] {
        &self.bytes[2..self.interface_end]
    }

    /// The historical bytes
    pub fn historical_bytes(&self) -> &[u8] {
        &self.bytes[self.historical_offset..self.historical_offset + self.historical_len]
    }

    /// The TCK checksum byte, if the ATR carries one
    pub const fn checksum(&self) -> Option<u8> {
        self.checksum
    }

    /// Whether the interface bytes match the contactless pattern
    pub const fn is_contactless(&self) -> bool {
        self.contactless
    }
}

// Some stacks hand back the ATR in a fixed-size buffer and report the
// buffer length instead of the ATR length, so one side may be zero-padded
// longer than the other. Compare after truncating to the shorter length
// instead of failing on the length mismatch.
impl PartialEq for Atr {
    fn eq(&self, other: &Self) -> bool {
        let n = self.bytes.len().min(other.bytes.len());
        self.bytes[..n] == other.bytes[..n]
    }
}

impl Eq for Atr {}
