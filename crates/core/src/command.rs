//! APDU command definitions
//!
//! This module provides the command APDU value object according to
//! ISO/IEC 7816-4. A command is immutable once built; its encoded byte
//! length is a pure function of its fields.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// CLA bit signalling that more command APDUs of a chain follow
const CLA_CHAINING: u8 = 0x10;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected response length (optional); 256 encodes as 0x00 in short form
    pub le: Option<u16>,
    /// Whether the CLA chaining bit is set on the wire
    pub chained: bool,
    /// Force extended length encoding even when short form would fit
    pub extended: bool,
    /// Next request of an explicit multi-APDU chain
    pub next: Option<Box<Command>>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
            chained: false,
            extended: false,
            next: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: u16) -> Self {
        let mut command = Self::new(cla, ins, p1, p2);
        command.le = Some(le);
        command
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        let mut command = Self::new(cla, ins, p1, p2);
        command.data = Some(data.into());
        command
    }

    /// Create a new command with both data and expected length
    pub fn new_with_data_and_le<T: Into<Bytes>>(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: T,
        le: u16,
    ) -> Self {
        let mut command = Self::new(cla, ins, p1, p2);
        command.data = Some(data.into());
        command.le = Some(le);
        command
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Set the CLA chaining bit
    pub const fn with_chaining(mut self) -> Self {
        self.chained = true;
        self
    }

    /// Force extended length encoding
    pub const fn with_extended_length(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Append a follow-up request to be sent after this one succeeds
    pub fn with_next(mut self, next: Self) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    /// The CLA byte as emitted on the wire, chaining bit included
    pub const fn effective_cla(&self) -> u8 {
        if self.chained {
            self.cla | CLA_CHAINING
        } else {
            self.cla
        }
    }

    /// Whether this command needs the extended length encoding
    pub fn uses_extended_length(&self) -> bool {
        self.extended
            || self.data.as_ref().is_some_and(|d| d.len() > 255)
            || self.le.is_some_and(|le| le > 256)
    }

    /// Convert to raw APDU bytes
    ///
    /// Uses the short encoding unless the payload or expected length do
    /// not fit, in which case the extended encoding is selected.
    pub fn to_bytes(&self) -> Bytes {
        let extended = self.uses_extended_length();
        let mut buffer = BytesMut::with_capacity(self.serialized_len());

        buffer.put_u8(self.effective_cla());
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if let Some(data) = &self.data {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(data.len() as u16);
            } else {
                buffer.put_u8(data.len() as u8);
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                if self.data.is_none() {
                    buffer.put_u8(0x00);
                }
                // Le = 65536 would encode as 0x0000; not representable here
                buffer.put_u16(le);
            } else {
                // 256 encodes as 0x00
                buffer.put_u8(le as u8);
            }
        }

        buffer.freeze()
    }

    /// Length of the serialized command, a pure function of the fields
    pub fn serialized_len(&self) -> usize {
        let extended = self.uses_extended_length();
        let mut length = 4;

        if let Some(data) = &self.data {
            length += if extended { 3 } else { 1 } + data.len();
        }

        if self.le.is_some() {
            length += if extended {
                if self.data.is_none() { 3 } else { 2 }
            } else {
                1
            };
        }

        length
    }

    /// Parse a short-form command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);

        if data.len() == 4 {
            return Ok(command);
        }

        if data.len() == 5 {
            // Only Le present, no data
            command.le = Some(data[4] as u16);
            return Ok(command);
        }

        let lc = data[4] as usize;
        if data.len() < 5 + lc {
            return Err(Error::InvalidCommandLength(data.len()));
        }
        if lc > 0 {
            command.data = Some(Bytes::copy_from_slice(&data[5..5 + lc]));
        }
        match data.len() - (5 + lc) {
            0 => {}
            1 => command.le = Some(data[5 + lc] as u16),
            _ => return Err(Error::InvalidCommandLength(data.len())),
        }

        Ok(command)
    }
}
