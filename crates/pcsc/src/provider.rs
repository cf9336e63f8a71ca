//! Provider boundary traits
//!
//! The lifecycle layer never talks to a platform PC/SC stack directly; an
//! application injects an implementation of [`CardProvider`] and the rest
//! of the crate is written against that seam. This keeps every state
//! machine testable against a scripted provider.

use std::time::Duration;

use cardlink_core::Protocol;

use crate::error::PcscError;

/// How a connection shares the card with other parties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Sole access; concurrent connects fail with a sharing violation
    Exclusive,
    /// Cooperative access alongside other shared connections
    Shared,
    /// Direct access to the terminal without requiring a card
    Direct,
}

/// What happens to the card when a connection or transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the card state untouched
    Leave,
    /// Warm reset
    Reset,
    /// Power the card down
    Unpower,
    /// Eject the card where the terminal supports it
    Eject,
}

/// Set of protocols acceptable during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet(u8);

impl ProtocolSet {
    /// T=0 only
    pub const T0: Self = Self(0b01);
    /// T=1 only
    pub const T1: Self = Self(0b10);
    /// Either protocol, provider picks
    pub const ANY: Self = Self(0b11);

    /// Whether every protocol in `other` is acceptable here
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl From<Protocol> for ProtocolSet {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::T0 => Self::T0,
            Protocol::T1 => Self::T1,
        }
    }
}

/// Identifier of a card or terminal attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeId(pub u32);

impl AttributeId {
    /// The raw ATR of the inserted card (SCARD_ATTR_ATR_STRING)
    pub const ATR_STRING: Self = Self(0x0009_0303);
}

/// Card presence as observed at a terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// No observation has been made yet
    Unknown,
    /// The terminal vanished while being queried
    Unavailable,
    /// Terminal present, no card inserted
    Empty,
    /// A card is inserted and answered with this ATR
    Present {
        /// Raw answer-to-reset bytes
        atr: Vec<u8>,
    },
}

impl TerminalStatus {
    /// Whether a card is present in this status
    pub const fn has_card(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    /// ATR bytes if a card is present
    pub fn atr(&self) -> Option<&[u8]> {
        match self {
            Self::Present { atr } => Some(atr),
            _ => None,
        }
    }
}

/// Result of a bounded status wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// The status moved away from the caller's last known value
    Changed(TerminalStatus),
    /// Nothing changed within the wait window
    Timeout,
}

/// Platform PC/SC stack as seen by this crate.
///
/// Implementations must be callable from multiple threads; every method
/// failure is reported as a [`PcscError`] already classified for retry.
pub trait CardProvider: Send + Sync {
    /// Names of the terminals currently attached
    fn list_terminals(&self) -> Result<Vec<String>, PcscError>;

    /// Open a connection to the card in `terminal`
    fn connect(
        &self,
        terminal: &str,
        share_mode: ShareMode,
        protocols: ProtocolSet,
    ) -> Result<Box<dyn ProviderConnection>, PcscError>;

    /// Wait up to `timeout` for the terminal's status to move away from
    /// `last_known`
    fn status(
        &self,
        terminal: &str,
        last_known: &TerminalStatus,
        timeout: Duration,
    ) -> Result<StatusChange, PcscError>;

    /// Interrupt any in-flight [`CardProvider::status`] wait
    fn cancel_status_wait(&self);
}

/// A live provider-level card handle.
///
/// The lifecycle layer serializes access itself; implementations only
/// need `Send`, not interior thread safety.
pub trait ProviderConnection: Send {
    /// Protocol the provider negotiated at connect time
    fn protocol(&self) -> Protocol;

    /// Start an exclusive transaction on the card
    fn begin_transaction(&mut self) -> Result<(), PcscError>;

    /// End the current transaction, applying `disposition` to the card
    fn end_transaction(&mut self, disposition: Disposition) -> Result<(), PcscError>;

    /// Exchange one raw APDU with the card
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, PcscError>;

    /// Send a control code to the terminal driver
    fn control(&mut self, code: u32, data: &[u8], out_capacity: usize)
    -> Result<Vec<u8>, PcscError>;

    /// Read a card or terminal attribute
    fn get_attribute(&mut self, id: AttributeId) -> Result<Vec<u8>, PcscError>;

    /// Release the handle, applying `disposition` to the card
    fn close(&mut self, disposition: Disposition) -> Result<(), PcscError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_set_membership() {
        assert!(ProtocolSet::ANY.contains(ProtocolSet::T0));
        assert!(ProtocolSet::ANY.contains(ProtocolSet::T1));
        assert!(!ProtocolSet::T0.contains(ProtocolSet::T1));
        assert_eq!(ProtocolSet::T0.union(ProtocolSet::T1), ProtocolSet::ANY);
        assert_eq!(ProtocolSet::from(Protocol::T1), ProtocolSet::T1);
    }

    #[test]
    fn test_terminal_status_accessors() {
        let present = TerminalStatus::Present {
            atr: vec![0x3B, 0x00],
        };
        assert!(present.has_card());
        assert_eq!(present.atr(), Some(&[0x3B, 0x00][..]));
        assert!(!TerminalStatus::Empty.has_card());
        assert_eq!(TerminalStatus::Unknown.atr(), None);
    }
}
