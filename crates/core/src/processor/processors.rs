//! The standard transmitter decorators
//!
//! - [`ContinuationProcessor`]: protocol-agnostic status-word continuation
//! - [`T0Processor`]: T=0 header derivation and ENVELOPE splitting
//! - [`T1Processor`]: T=1 pass-through framing

use bytes::BytesMut;
use tracing::trace;

use super::CommandProcessor;
use crate::{Command, Error, Response, transport::CardTransport};

/// INS byte of the GET RESPONSE command
pub const INS_GET_RESPONSE: u8 = 0xC0;
/// INS byte of the ENVELOPE command
pub const INS_ENVELOPE: u8 = 0xC2;

/// T=0 splits oversized payloads into ENVELOPE chunks of this size; a
/// full chunk encodes its length as P3 = 0x00.
const ENVELOPE_CHUNK: usize = 256;

fn exchange(transport: &mut dyn CardTransport, wire: &[u8]) -> Result<Response, Error> {
    trace!(wire = %hex::encode(wire), "transmit");
    let response_bytes = transport.transmit_raw(wire)?;
    trace!(wire = %hex::encode(&response_bytes), "response");
    Response::from_buffer(response_bytes)
}

/// Generic status-word continuation layer over any framer
///
/// After the wrapped framer returns, SW1 = 0x6C triggers one resend with
/// the corrected expected length, SW1 = 0x61 fetches the waiting data via
/// GET RESPONSE, and a `next` link on the request chains onto the follow-up
/// command once the current response is error-free.
#[derive(Debug)]
pub struct ContinuationProcessor {
    inner: Box<dyn CommandProcessor>,
}

impl ContinuationProcessor {
    /// Wrap a framer with the continuation rules
    pub fn new(inner: impl CommandProcessor + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl CommandProcessor for ContinuationProcessor {
    fn process(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, Error> {
        let mut response = self.inner.process(command, transport)?;

        let status = response.status();
        if status.wrong_length() {
            // one resend with the corrected Le from SW2
            let corrected = command.clone().with_le(status.sw2 as u16);
            response = self.inner.process(&corrected, transport)?;
        }

        // checked again: the corrected resend may itself answer 61
        let status = response.status();
        if status.more_data_available() {
            let get_response = Command::new_with_le(
                command.effective_cla(),
                INS_GET_RESPONSE,
                0x00,
                0x00,
                status.sw2 as u16,
            );
            response = self.inner.process(&get_response, transport)?;
        }

        if let Some(next) = &command.next {
            if response.is_success() {
                return self.process(next, transport);
            }
        }

        Ok(response)
    }
}

/// T=0 framer
///
/// Builds the 5-byte CLA/INS/P1/P2/P3 header from the four ISO 7816-4
/// cases and handles what T=0 cannot express natively: payloads of 256
/// bytes or more go out as successive ENVELOPE commands, and a bare
/// `90 00` answer to a request that expected data is followed by an
/// explicit GET RESPONSE, since some readers do not chain it themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct T0Processor;

impl T0Processor {
    fn get_response(
        &self,
        transport: &mut dyn CardTransport,
        cla: u8,
        mut expected: u8,
    ) -> Result<Response, Error> {
        let mut assembled = BytesMut::new();
        loop {
            let wire = [cla, INS_GET_RESPONSE, 0x00, 0x00, expected];
            let response = exchange(transport, &wire)?;
            assembled.extend_from_slice(response.data());
            let status = response.status();
            if status.more_data_available() {
                expected = status.sw2;
                continue;
            }
            assembled.extend_from_slice(&[status.sw1, status.sw2]);
            return Response::from_buffer(assembled.freeze());
        }
    }

    /// Status-word handling after the framed or enveloped exchange
    fn finish(
        &self,
        transport: &mut dyn CardTransport,
        header: [u8; 4],
        le: Option<u16>,
        response: Response,
    ) -> Result<Response, Error> {
        let mut response = response;

        let status = response.status();
        if status.wrong_length() {
            // resend once with the corrected P3 from SW2
            let wire = [header[0], header[1], header[2], header[3], status.sw2];
            response = exchange(transport, &wire)?;
        }

        let status = response.status();
        if status.more_data_available() {
            return self.get_response(transport, header[0], status.sw2);
        }
        if response.is_success() && response.data().is_empty() && le.is_some_and(|le| le > 0) {
            return self.get_response(transport, header[0], le.unwrap_or_default() as u8);
        }

        Ok(response)
    }

    /// Send an oversized body as successive ENVELOPE commands
    ///
    /// The exchange is complete only once the final chunk's response has
    /// been received; a refusal part-way through ends the chain early.
    fn envelope(
        &self,
        transport: &mut dyn CardTransport,
        command: &Command,
        body: &[u8],
    ) -> Result<Response, Error> {
        let cla = command.effective_cla();
        let header = [cla, INS_ENVELOPE, 0x00, 0x00];
        let mut chunks = body.chunks(ENVELOPE_CHUNK).peekable();
        loop {
            let chunk = chunks.next().ok_or(Error::Protocol("empty ENVELOPE body"))?;
            let mut wire = Vec::with_capacity(5 + chunk.len());
            wire.extend_from_slice(&header);
            wire.push(chunk.len() as u8);
            wire.extend_from_slice(chunk);
            let response = exchange(transport, &wire)?;
            if chunks.peek().is_none() {
                return self.finish(transport, header, command.le, response);
            }
            if !response.is_success() {
                return Ok(response);
            }
        }
    }
}

impl CommandProcessor for T0Processor {
    fn process(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, Error> {
        let cla = command.effective_cla();
        let data = command.data.as_deref().unwrap_or_default();

        // T=0 has no native extended length support
        if data.len() >= ENVELOPE_CHUNK {
            return self.envelope(transport, command, data);
        }
        if command.le.is_some_and(|le| le > 256) {
            let serialized = command.to_bytes();
            return self.envelope(transport, command, &serialized);
        }

        let header = [cla, command.ins, command.p1, command.p2];
        let mut wire = Vec::with_capacity(5 + data.len());
        wire.extend_from_slice(&header);
        if data.is_empty() {
            // case 1: P3 = 0; case 2: P3 = Le, with 256 encoding as 0x00
            wire.push(command.le.unwrap_or_default() as u8);
        } else {
            // cases 3 and 4: P3 = Lc, data follows; Le is not on the wire
            wire.push(data.len() as u8);
            wire.extend_from_slice(data);
        }

        let response = exchange(transport, &wire)?;
        self.finish(transport, header, command.le, response)
    }
}

/// T=1 framer
///
/// The request is transmitted as-is; block-level chaining is the
/// provider's responsibility. Pair with [`ContinuationProcessor`] for
/// status-word continuation.
#[derive(Debug, Clone, Copy, Default)]
pub struct T1Processor;

impl CommandProcessor for T1Processor {
    fn process(
        &self,
        command: &Command,
        transport: &mut dyn CardTransport,
    ) -> Result<Response, Error> {
        exchange(transport, &command.to_bytes())
    }
}
