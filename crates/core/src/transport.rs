//! Raw transport abstraction
//!
//! [`CardTransport`] is the primitive the transmitter decorators sit on:
//! one opaque byte exchange with the card. The PC/SC layer implements it
//! over a provider connection handle; tests implement it with a script.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::Error;

/// The byte-level transmission protocol negotiated with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Character-oriented protocol; framing is built in software
    T0,
    /// Block-oriented protocol; the provider handles block chaining
    T1,
}

/// Raw transmit primitive the protocol transmitters decorate
pub trait CardTransport: Send {
    /// Exchange one raw command APDU for one raw response APDU
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error>;
}

impl CardTransport for &mut dyn CardTransport {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error> {
        (**self).transmit_raw(command)
    }
}

/// Scripted transport for tests
///
/// Returns queued responses in order and records every command it was
/// given, so tests can assert on the exact wire traffic.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: VecDeque<Result<Bytes, Error>>,
    /// Every command transmitted, in order
    pub commands: Vec<Vec<u8>>,
}

impl MockTransport {
    /// Create an empty scripted transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a single queued response
    pub fn with_response(response: impl Into<Bytes>) -> Self {
        let mut transport = Self::new();
        transport.push_response(response);
        transport
    }

    /// Queue a response
    pub fn push_response(&mut self, response: impl Into<Bytes>) -> &mut Self {
        self.responses.push_back(Ok(response.into()));
        self
    }

    /// Queue an error
    pub fn push_error(&mut self, error: Error) -> &mut Self {
        self.responses.push_back(Err(error));
        self
    }
}

impl CardTransport for MockTransport {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, Error> {
        self.commands.push(command.to_vec());
        match self.responses.pop_front() {
            Some(scripted) => scripted,
            None => Err(Error::Protocol("mock transport script exhausted")),
        }
    }
}
