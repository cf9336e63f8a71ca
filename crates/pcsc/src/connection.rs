//! Connections: serialized I/O, transactions, keep-alive
//!
//! Every provider call goes through the handle mutex, so concurrent users
//! of one connection are serialized without any caller-side locking. The
//! close path is idempotent: the handle is taken out of its slot exactly
//! once, and later closes are no-ops.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use cardlink_core::{
    CardTransport, Command, Error as CoreError, ProcessorPipeline, Protocol, Response,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::card::Card;
use crate::config::{ConnectConfig, KeepAliveConfig};
use crate::error::PcscError;
use crate::provider::{AttributeId, Disposition, ProviderConnection, ShareMode};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ConnectionState {
    closed: bool,
    transaction_active: bool,
    last_used: Instant,
}

/// An open connection to a card.
///
/// Obtained from [`Card::connect_shared`](crate::Card::connect_shared) or
/// [`Card::connect_exclusive`](crate::Card::connect_exclusive). Commands
/// submitted here run through the protocol transmitter chain for the
/// negotiated protocol, so callers see complete responses with
/// continuation already handled.
pub struct Connection {
    id: u64,
    card: Weak<Card>,
    share_mode: ShareMode,
    protocol: Protocol,
    pipeline: ProcessorPipeline,
    config: ConnectConfig,
    handle: Mutex<Option<Box<dyn ProviderConnection>>>,
    state: Mutex<ConnectionState>,
    keep_alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("share_mode", &self.share_mode)
            .field("protocol", &self.protocol)
            .field("closed", &state.closed)
            .field("transaction_active", &state.transaction_active)
            .finish()
    }
}

/// Adapter giving the transmitter chain raw access to the provider handle
struct HandleTransport<'a> {
    inner: &'a mut dyn ProviderConnection,
}

impl CardTransport for HandleTransport<'_> {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, CoreError> {
        self.inner
            .transmit(command)
            .map(Bytes::from)
            .map_err(CoreError::from)
    }
}

impl Connection {
    pub(crate) fn new(
        handle: Box<dyn ProviderConnection>,
        card: Weak<Card>,
        share_mode: ShareMode,
        config: &ConnectConfig,
    ) -> Arc<Self> {
        let protocol = handle.protocol();
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            card,
            share_mode,
            protocol,
            pipeline: ProcessorPipeline::for_protocol(protocol),
            config: config.clone(),
            handle: Mutex::new(Some(handle)),
            state: Mutex::new(ConnectionState {
                closed: false,
                transaction_active: false,
                last_used: Instant::now(),
            }),
            keep_alive: Mutex::new(None),
        })
    }

    /// Process-unique identifier of this connection
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Sharing semantics this connection was opened with
    pub const fn share_mode(&self) -> ShareMode {
        self.share_mode
    }

    /// Protocol the provider negotiated
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a transaction is currently active
    pub fn transaction_active(&self) -> bool {
        self.state.lock().transaction_active
    }

    /// Whether the connection and its card are still usable
    pub fn is_valid(&self) -> bool {
        if self.state.lock().closed {
            return false;
        }
        match self.card.upgrade() {
            Some(card) => !card.state().is_invalid(),
            None => false,
        }
    }

    fn ensure_valid(&self) -> Result<(), PcscError> {
        if !self.is_valid() {
            return Err(PcscError::InvalidState("connection is closed or invalid"));
        }
        Ok(())
    }

    fn touch(&self) {
        self.state.lock().last_used = Instant::now();
    }

    /// Send a command through the transmitter chain and return the
    /// complete response
    pub fn transmit(&self, command: &Command) -> Result<Response, PcscError> {
        self.ensure_valid()?;
        self.touch();
        let mut guard = self.handle.lock();
        let handle = guard
            .as_mut()
            .ok_or(PcscError::InvalidState("connection is closed"))?;
        let mut transport = HandleTransport {
            inner: handle.as_mut(),
        };
        let response = self.pipeline.process_command(command, &mut transport)?;
        Ok(response)
    }

    /// Send a control code to the terminal driver
    pub fn control(
        &self,
        code: u32,
        data: &[u8],
        out_capacity: usize,
    ) -> Result<Vec<u8>, PcscError> {
        self.ensure_valid()?;
        self.touch();
        let mut guard = self.handle.lock();
        let handle = guard
            .as_mut()
            .ok_or(PcscError::InvalidState("connection is closed"))?;
        handle.control(code, data, out_capacity)
    }

    /// Read a card or terminal attribute
    pub fn get_attribute(&self, id: AttributeId) -> Result<Vec<u8>, PcscError> {
        self.ensure_valid()?;
        self.touch();
        let mut guard = self.handle.lock();
        let handle = guard
            .as_mut()
            .ok_or(PcscError::InvalidState("connection is closed"))?;
        handle.get_attribute(id)
    }

    /// Start an exclusive transaction and the keep-alive worker that
    /// guards it against the platform's idle reset
    ///
    /// The handle mutex is held from the already-active check through the
    /// provider call and the flag set, so two concurrent callers cannot
    /// both reach the provider: the loser waits and then fails the check.
    pub fn begin_transaction(self: &Arc<Self>) -> Result<(), PcscError> {
        self.ensure_valid()?;
        {
            let mut guard = self.handle.lock();
            if self.state.lock().transaction_active {
                return Err(PcscError::InvalidState("transaction already active"));
            }
            let handle = guard
                .as_mut()
                .ok_or(PcscError::InvalidState("connection is closed"))?;
            handle.begin_transaction()?;
            let mut state = self.state.lock();
            state.transaction_active = true;
            state.last_used = Instant::now();
        }
        self.start_keep_alive();
        trace!(connection = self.id, "transaction started");
        Ok(())
    }

    /// End the current transaction.
    ///
    /// The local flag is cleared even when the provider call fails, so a
    /// failed end never wedges the connection in a transacted state.
    /// Ending with no transaction active is a no-op.
    pub fn end_transaction(&self, disposition: Disposition) -> Result<(), PcscError> {
        if !self.state.lock().transaction_active {
            return Ok(());
        }
        self.stop_keep_alive();
        let result = {
            let mut guard = self.handle.lock();
            match guard.as_mut() {
                Some(handle) => handle.end_transaction(disposition),
                None => Ok(()),
            }
        };
        self.state.lock().transaction_active = false;
        trace!(connection = self.id, "transaction ended");
        result
    }

    /// Close the connection, applying `disposition` to the card.
    ///
    /// Safe to call any number of times and concurrently with in-flight
    /// commands; the provider handle is released exactly once, after the
    /// command currently holding it completes.
    pub fn close(&self, disposition: Disposition) -> Result<(), PcscError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.transaction_active = false;
        }
        self.stop_keep_alive();
        // drop out of the card's registry before the provider close so a
        // concurrent card disposal cannot close the same handle twice
        if let Some(card) = self.card.upgrade() {
            card.unregister(self);
        }
        let handle = self.handle.lock().take();
        debug!(connection = self.id, ?disposition, "connection closed");
        match handle {
            Some(mut handle) => handle.close(disposition),
            None => Ok(()),
        }
    }

    /// Close with the configured disposition, logging instead of
    /// returning any failure
    pub fn force_close(&self) {
        if let Err(error) = self.close(self.config.disposition) {
            debug!(connection = self.id, error = %error, "close failed");
        }
    }

    fn start_keep_alive(self: &Arc<Self>) {
        let running = Arc::new(AtomicBool::new(true));
        *self.keep_alive.lock() = Some(running.clone());
        let connection = Arc::downgrade(self);
        let config = self.config.keep_alive;
        thread::spawn(move || keep_alive_loop(&connection, &running, config));
    }

    fn stop_keep_alive(&self) {
        if let Some(running) = self.keep_alive.lock().take() {
            running.store(false, Ordering::Release);
        }
    }
}

/// Worker guarding a transacted connection against the platform's
/// five-second idle reset.
///
/// Holds only a weak reference between ticks and is never joined, so it
/// can neither keep a connection alive nor deadlock a close initiated
/// from its own ping failure.
fn keep_alive_loop(
    connection: &Weak<Connection>,
    running: &Arc<AtomicBool>,
    config: KeepAliveConfig,
) {
    while running.load(Ordering::Acquire) {
        thread::sleep(config.interval);
        let Some(connection) = connection.upgrade() else {
            return;
        };
        let idle = {
            let state = connection.state.lock();
            if state.closed || !state.transaction_active {
                return;
            }
            state.last_used.elapsed()
        };
        if idle < config.max_idle {
            continue;
        }
        let ping = {
            let mut guard = connection.handle.lock();
            match guard.as_mut() {
                Some(handle) => handle.get_attribute(AttributeId::ATR_STRING),
                None => return,
            }
        };
        match ping {
            Ok(_) => {
                trace!(connection = connection.id, "keep-alive ping");
                connection.touch();
            }
            Err(error) => {
                warn!(
                    connection = connection.id,
                    error = %error,
                    "keep-alive ping failed; closing connection"
                );
                running.store(false, Ordering::Release);
                connection.force_close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::card::CardState;
    use crate::provider::CardProvider;
    use crate::terminal::Terminal;
    use crate::testutil::MockProvider;

    fn connected(
        provider: &Arc<MockProvider>,
        config: &ConnectConfig,
    ) -> (Arc<Terminal>, Arc<Card>, Arc<Connection>) {
        let dyn_provider: Arc<dyn CardProvider> = provider.clone();
        let terminal = Terminal::new("Mock Reader 0", dyn_provider);
        let card = terminal.install_card(vec![0x3B, 0x00]);
        let connection = card.connect_shared(config).unwrap();
        (terminal, card, connection)
    }

    #[test]
    fn test_transmit_runs_transmitter_chain() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        provider.script_transmit(vec![0x90, 0x00]);
        let (_terminal, _card, connection) = connected(&provider, &ConnectConfig::default());

        let response = connection
            .transmit(&Command::new(0x00, 0xA4, 0x04, 0x00))
            .unwrap();
        assert!(response.is_success());
    }

    #[test]
    fn test_transmit_after_close_fails() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        let (_terminal, _card, connection) = connected(&provider, &ConnectConfig::default());

        connection.close(Disposition::Leave).unwrap();
        assert!(matches!(
            connection.transmit(&Command::new(0x00, 0xA4, 0x04, 0x00)),
            Err(PcscError::InvalidState(_))
        ));
    }

    #[test]
    fn test_transaction_flags() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        let (_terminal, _card, connection) = connected(&provider, &ConnectConfig::default());

        assert!(!connection.transaction_active());
        connection.begin_transaction().unwrap();
        assert!(connection.transaction_active());
        assert!(matches!(
            connection.begin_transaction(),
            Err(PcscError::InvalidState(_))
        ));
        connection.end_transaction(Disposition::Leave).unwrap();
        assert!(!connection.transaction_active());
        // ending again is a no-op
        connection.end_transaction(Disposition::Leave).unwrap();
    }

    #[test]
    fn test_concurrent_begin_transaction_admits_one() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        let gate = provider.gate_next_begin_transaction();
        let (_terminal, _card, connection) = connected(&provider, &ConnectConfig::default());

        let contenders: Vec<_> = (0..2)
            .map(|_| {
                let connection = connection.clone();
                std::thread::spawn(move || connection.begin_transaction())
            })
            .collect();
        provider.wait_for_begin_calls(1, Duration::from_secs(2));
        gate.open();

        let results: Vec<_> = contenders
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(PcscError::InvalidState("transaction already active"))
        )));
        assert_eq!(provider.begin_calls(), 1);
        connection.end_transaction(Disposition::Leave).unwrap();
    }

    #[test]
    fn test_failed_end_transaction_still_clears_flag() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        provider.script_end_transaction_error(PcscError::CardReset);
        let (_terminal, _card, connection) = connected(&provider, &ConnectConfig::default());

        connection.begin_transaction().unwrap();
        assert_eq!(
            connection.end_transaction(Disposition::Leave),
            Err(PcscError::CardReset)
        );
        assert!(!connection.transaction_active());
    }

    #[test]
    fn test_keep_alive_pings_idle_transaction() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        let config = ConnectConfig::default().with_keep_alive(KeepAliveConfig {
            interval: Duration::from_millis(10),
            max_idle: Duration::from_millis(25),
        });
        let (_terminal, _card, connection) = connected(&provider, &config);

        connection.begin_transaction().unwrap();
        provider.wait_for_attribute_calls(1, Duration::from_secs(2));
        assert!(connection.is_valid());
        connection.end_transaction(Disposition::Leave).unwrap();
    }

    #[test]
    fn test_keep_alive_failure_closes_connection() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        provider.script_attribute_error(PcscError::CardReset);
        let config = ConnectConfig::default().with_keep_alive(KeepAliveConfig {
            interval: Duration::from_millis(10),
            max_idle: Duration::from_millis(25),
        });
        let (_terminal, card, connection) = connected(&provider, &config);

        connection.begin_transaction().unwrap();
        provider.wait_for_close_calls(1, Duration::from_secs(2));
        assert!(connection.is_closed());
        assert_eq!(card.state(), CardState::NotConnected);
    }

    #[test]
    fn test_card_disposal_invalidates_connection() {
        let provider = Arc::new(MockProvider::new(&["Mock Reader 0"]));
        let (terminal, card, connection) = connected(&provider, &ConnectConfig::default());

        terminal.remove_card();
        assert_eq!(card.state(), CardState::Invalid);
        assert!(connection.is_closed());
        assert!(!connection.is_valid());
        assert_eq!(provider.close_calls(), 1);
    }
}
