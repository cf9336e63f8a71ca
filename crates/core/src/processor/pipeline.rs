//! Processor pipeline for command processing

use std::fmt;

use tracing::{debug, trace};

use super::CommandProcessor;
use super::processors::{ContinuationProcessor, T0Processor, T1Processor};
use crate::{Command, Error, Response, transport::CardTransport, transport::Protocol};

/// Command processor pipeline
///
/// The first processor in the pipeline owns the exchange; an empty
/// pipeline transmits the command's serialized bytes directly.
#[derive(Default)]
pub struct ProcessorPipeline {
    processors: Vec<Box<dyn CommandProcessor>>,
}

impl fmt::Debug for ProcessorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorPipeline")
            .field("processor_count", &self.processors.len())
            .finish()
    }
}

impl ProcessorPipeline {
    /// Create a new empty processor pipeline
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// The standard transmitter chain for a negotiated protocol
    ///
    /// T=0 framing handles its own continuation rules; T=1 pairs the raw
    /// framer with the generic continuation layer.
    pub fn for_protocol(protocol: Protocol) -> Self {
        let mut pipeline = Self::new();
        match protocol {
            Protocol::T0 => {
                pipeline.add_processor(Box::new(T0Processor));
            }
            Protocol::T1 => {
                pipeline.add_processor(Box::new(ContinuationProcessor::new(T1Processor)));
            }
        }
        pipeline
    }

    /// Add a processor to the pipeline
    pub fn add_processor(&mut self, processor: Box<dyn CommandProcessor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    /// Clear all processors from the pipeline
    pub fn clear(&mut self) {
        self.processors.clear();
    }

    /// Process a command through the pipeline
    pub fn process_command(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, Error> {
        trace!(command = ?command, "processing command");
        let result = match self.processors.first() {
            Some(processor) => processor.process(command, transport),
            None => {
                let command_bytes = command.to_bytes();
                trace!(wire = %hex::encode(&command_bytes), "direct raw transmission");
                let response_bytes = transport.transmit_raw(&command_bytes)?;
                Response::from_buffer(response_bytes)
            }
        };
        match &result {
            Ok(response) => trace!(status = %response.status(), "command complete"),
            Err(err) => debug!(error = ?err, "command failed"),
        }
        result
    }
}
