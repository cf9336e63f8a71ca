//! Card objects: connect arbitration, state machine, disposal
//!
//! Card state moves strictly forward: `Unknown` at construction, then
//! between `NotConnected` and the connected states, and finally `Invalid`
//! once the card is removed or its terminal detaches. `Invalid` is
//! terminal; no transition ever leaves it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;

use cardlink_core::Atr;
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ConnectConfig;
use crate::connection::Connection;
use crate::error::PcscError;
use crate::provider::{CardProvider, ShareMode};
use crate::terminal::Terminal;

/// Lifecycle state of a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Observed but not yet installed on its terminal
    Unknown,
    /// Installed, no open connections
    NotConnected,
    /// At least one shared connection is open
    ConnectedShared,
    /// An exclusive connection is open
    ConnectedExclusive,
    /// Removed or orphaned; the object is permanently dead
    Invalid,
}

impl CardState {
    /// Whether this is the terminal `Invalid` state
    pub const fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }
}

/// Outcome delivered to every waiter of a shared connect attempt
pub type ConnectOutcome = Result<Arc<Connection>, PcscError>;

struct PendingConnect {
    waiters: Vec<crossbeam_channel::Sender<ConnectOutcome>>,
}

/// A card observed in a terminal.
///
/// The object is identity-stable for as long as the physical card stays
/// inserted: repeated lookups through the terminal return the same `Arc`.
/// Removal or terminal detachment disposes it, and a disposed card never
/// comes back to life.
pub struct Card {
    provider: Arc<dyn CardProvider>,
    terminal: Weak<Terminal>,
    terminal_name: String,
    atr_bytes: Vec<u8>,
    atr: Option<Atr>,
    state: Mutex<CardState>,
    connections: Mutex<Vec<Arc<Connection>>>,
    pending_connect: Mutex<Option<PendingConnect>>,
    retry_attempts: Mutex<u32>,
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("terminal", &self.terminal_name)
            .field("atr", &hex::encode(&self.atr_bytes))
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Card {
    pub(crate) fn new(
        provider: Arc<dyn CardProvider>,
        terminal: &Arc<Terminal>,
        atr_bytes: Vec<u8>,
    ) -> Arc<Self> {
        let atr = Atr::parse(&atr_bytes).ok();
        Arc::new(Self {
            provider,
            terminal: Arc::downgrade(terminal),
            terminal_name: terminal.name().to_string(),
            atr_bytes,
            atr,
            state: Mutex::new(CardState::Unknown),
            connections: Mutex::new(Vec::new()),
            pending_connect: Mutex::new(None),
            retry_attempts: Mutex::new(0),
        })
    }

    /// Name of the terminal holding this card
    pub fn terminal_name(&self) -> &str {
        &self.terminal_name
    }

    /// Raw ATR the card answered with at insertion
    pub fn atr_bytes(&self) -> &[u8] {
        &self.atr_bytes
    }

    /// Decoded ATR, if the raw bytes parsed
    pub const fn atr(&self) -> Option<&Atr> {
        self.atr.as_ref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CardState {
        *self.state.lock()
    }

    fn ensure_valid(&self) -> Result<(), PcscError> {
        if self.state().is_invalid() {
            return Err(PcscError::InvalidState("card is invalid"));
        }
        Ok(())
    }

    /// Open an exclusive connection.
    ///
    /// Local arbitration happens before the provider is asked: if any
    /// connection is already open on this card, the attempt fails with a
    /// sharing violation without touching the platform.
    pub fn connect_exclusive(
        self: &Arc<Self>,
        config: &ConnectConfig,
    ) -> Result<Arc<Connection>, PcscError> {
        self.ensure_valid()?;
        if !self.connections.lock().is_empty() {
            return Err(PcscError::SharingViolation);
        }
        let handle =
            self.provider
                .connect(&self.terminal_name, ShareMode::Exclusive, config.protocols)?;
        let connection =
            Connection::new(handle, Arc::downgrade(self), ShareMode::Exclusive, config);
        self.register(&connection, CardState::ConnectedExclusive)?;
        Ok(connection)
    }

    /// Open a shared connection, waiting up to the configured timeout.
    ///
    /// At most one provider connect is ever in flight per card; callers
    /// arriving while one is running join it and receive the same
    /// connection (or the same error). A caller that times out abandons
    /// the attempt, and if the attempt later succeeds with nobody left
    /// waiting, the connection is closed instead of leaked.
    pub fn connect_shared(
        self: &Arc<Self>,
        config: &ConnectConfig,
    ) -> Result<Arc<Connection>, PcscError> {
        let rx = self.connect_shared_async(config);
        match rx.recv_timeout(config.connect_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(PcscError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(PcscError::Cancelled),
        }
    }

    /// Start (or join) a shared connect attempt and return a receiver for
    /// its outcome.
    ///
    /// Joiners observe the outcome of the attempt already in flight; the
    /// configuration of later callers does not alter it.
    pub fn connect_shared_async(self: &Arc<Self>, config: &ConnectConfig) -> Receiver<ConnectOutcome> {
        let (tx, rx) = bounded(1);
        if let Err(error) = self.ensure_valid() {
            let _ = tx.send(Err(error));
            return rx;
        }
        {
            let mut pending = self.pending_connect.lock();
            if let Some(pending) = pending.as_mut() {
                trace!(terminal = %self.terminal_name, "joining in-flight connect");
                pending.waiters.push(tx);
                return rx;
            }
            *pending = Some(PendingConnect { waiters: vec![tx] });
        }
        let card = Arc::clone(self);
        let config = config.clone();
        thread::spawn(move || {
            let outcome = card.run_shared_connect(&config);
            card.deliver_connect_outcome(outcome);
        });
        rx
    }

    fn run_shared_connect(self: &Arc<Self>, config: &ConnectConfig) -> ConnectOutcome {
        self.ensure_valid()?;
        if self
            .connections
            .lock()
            .iter()
            .any(|connection| connection.share_mode() == ShareMode::Exclusive)
        {
            return Err(PcscError::SharingViolation);
        }
        let handle =
            self.provider
                .connect(&self.terminal_name, ShareMode::Shared, config.protocols)?;
        let connection = Connection::new(handle, Arc::downgrade(self), ShareMode::Shared, config);
        self.register(&connection, CardState::ConnectedShared)?;
        Ok(connection)
    }

    fn deliver_connect_outcome(&self, outcome: ConnectOutcome) {
        let waiters = self
            .pending_connect
            .lock()
            .take()
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        let mut delivered = 0usize;
        for waiter in waiters {
            if waiter.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            if let Ok(connection) = outcome {
                debug!(
                    terminal = %self.terminal_name,
                    "connect finished with no waiters left; closing"
                );
                connection.force_close();
            }
        }
    }

    /// Register an opened connection and advance the card state.
    ///
    /// The provider call happens outside any lock, so the card may have
    /// been disposed in the meantime; in that case the fresh connection
    /// is closed again and the connect fails.
    fn register(
        &self,
        connection: &Arc<Connection>,
        state: CardState,
    ) -> Result<(), PcscError> {
        self.connections.lock().push(connection.clone());
        self.set_state(state);
        if self.state().is_invalid() {
            self.unregister(connection);
            connection.force_close();
            return Err(PcscError::InvalidState("card invalidated during connect"));
        }
        Ok(())
    }

    /// Drop a closed connection from the registry; the last one out moves
    /// the card back to `NotConnected`
    pub(crate) fn unregister(&self, connection: &Connection) {
        let empty = {
            let mut connections = self.connections.lock();
            if let Some(index) = connections
                .iter()
                .position(|candidate| candidate.id() == connection.id())
            {
                connections.remove(index);
            }
            connections.is_empty()
        };
        if empty && !self.state().is_invalid() {
            self.set_state(CardState::NotConnected);
        }
    }

    /// First observation on the terminal: `Unknown` becomes `NotConnected`
    pub(crate) fn activate(&self) {
        self.set_state(CardState::NotConnected);
    }

    fn set_state(&self, new: CardState) {
        let transition = {
            let mut state = self.state.lock();
            let from = *state;
            if from == new || from.is_invalid() {
                None
            } else {
                *state = new;
                Some(from)
            }
        };
        if let Some(from) = transition {
            trace!(
                terminal = %self.terminal_name,
                ?from,
                to = ?new,
                "card state changed"
            );
            if let Some(terminal) = self.terminal.upgrade() {
                terminal.notify_card_state(from, new);
            }
        }
    }

    /// Kill the card: force-close every connection, then go `Invalid`.
    ///
    /// Close failures are logged and swallowed; disposal always completes.
    pub(crate) fn dispose(&self) {
        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        if !connections.is_empty() {
            warn!(
                terminal = %self.terminal_name,
                open = connections.len(),
                "disposing card with open connections"
            );
        }
        for connection in connections {
            connection.force_close();
        }
        self.set_state(CardState::Invalid);
    }

    /// Attempts recorded since the last successful acquisition
    pub fn retry_attempts(&self) -> u32 {
        *self.retry_attempts.lock()
    }

    /// Record a failed acquisition attempt; returns the zero-based index
    /// of the attempt that just failed
    pub fn record_retry(&self) -> u32 {
        let mut attempts = self.retry_attempts.lock();
        let current = *attempts;
        *attempts = current.saturating_add(1);
        current
    }

    /// Clear the attempt counter after a success
    pub fn reset_retries(&self) {
        *self.retry_attempts.lock() = 0;
    }
}
