//! Command processors for APDU transmission
//!
//! Processors are decorators between a [`Command`] and the raw transport:
//! a framer turns the command into wire bytes according to the negotiated
//! protocol, and a continuation layer above it drives status-word driven
//! follow-ups (corrected-length retry, GET RESPONSE, command chaining).

pub mod pipeline;
pub mod processors;

use std::fmt;

use crate::{Command, Error, Response, transport::CardTransport};

/// Trait for command processors
///
/// A processor may rewrite the command before transmission, issue
/// follow-up exchanges of its own, or delegate to a wrapped processor.
pub trait CommandProcessor: Send + Sync + fmt::Debug {
    /// Process a command and return the final response
    fn process(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, Error>;
}
