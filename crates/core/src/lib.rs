//! Protocol-level types for smart card communication
//!
//! This crate provides the hardware-independent half of the cardlink
//! middleware:
//!
//! - Parsing the Answer-To-Reset (ATR) a card sends on power-up
//! - Creating and parsing APDU commands and responses per ISO/IEC 7816-4
//! - Transmitter decorators that drive status-word continuation
//!   (GET RESPONSE, corrected-length retry, command chaining) and the
//!   T=0 / T=1 framing rules on top of any raw transport
//! - A retry policy classifying transient hardware failures
//!
//! Everything here is a pure function of its inputs; the lifecycle and
//! concurrency model live in `cardlink-pcsc`.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

// Main modules
pub mod atr;
pub mod command;
pub mod error;
pub mod processor;
pub mod response;
pub mod retry;
pub mod transport;

pub use atr::{Atr, Convention};
pub use command::Command;
pub use error::{Error, FailureKind};
pub use processor::CommandProcessor;
pub use processor::pipeline::ProcessorPipeline;
pub use response::{Response, StatusWord};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{CardTransport, Protocol};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error, FailureKind};

    pub use crate::atr::{Atr, Convention};
    pub use crate::command::Command;
    pub use crate::response::{Response, StatusWord};

    pub use crate::transport::{CardTransport, Protocol};

    pub use crate::processor::CommandProcessor;
    pub use crate::processor::pipeline::ProcessorPipeline;
    pub use crate::processor::processors::{ContinuationProcessor, T0Processor, T1Processor};

    pub use crate::retry::{RetryDecision, RetryPolicy};
}
