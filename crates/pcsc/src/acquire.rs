//! Connection-acquisition monitor
//!
//! Listens for card insertions and drives the connect-plus-transaction
//! handshake for each one, retrying transient failures under the
//! acquisition retry policy. Applications receive a ready, transacted
//! connection through their callback and give-up failures through a
//! channel.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cardlink_core::retry::{RetryDecision, RetryPolicy};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::card::Card;
use crate::config::ConnectConfig;
use crate::connection::Connection;
use crate::error::PcscError;
use crate::event::TopologyEvent;
use crate::monitor::TopologyMonitor;
use crate::system::CardSystem;

/// Callback invoked with each successfully acquired connection.
///
/// The connection arrives with a transaction already active. Returning an
/// error makes the monitor close the connection instead of leaking it.
pub type ReadyCallback = dyn Fn(&Arc<Connection>) -> Result<(), PcscError> + Send + Sync;

/// A terminal name paired with the error that ended its acquisition
pub type AcquireFailure = (String, PcscError);

struct Inner {
    system: Arc<CardSystem>,
    config: ConnectConfig,
    policy: RetryPolicy,
    callback: Box<ReadyCallback>,
    in_flight: Mutex<HashSet<String>>,
    running: AtomicBool,
    failure_tx: Sender<AcquireFailure>,
}

/// Acquires a transacted connection for every inserted card
pub struct AcquireMonitor {
    inner: Arc<Inner>,
    failure_rx: Receiver<AcquireFailure>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AcquireMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireMonitor")
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish()
    }
}

impl AcquireMonitor {
    /// Create an acquisition monitor.
    ///
    /// `policy` is usually [`RetryPolicy::acquisition`]; the callback runs
    /// on a per-card worker thread.
    pub fn new<F>(
        system: Arc<CardSystem>,
        config: ConnectConfig,
        policy: RetryPolicy,
        callback: F,
    ) -> Self
    where
        F: Fn(&Arc<Connection>) -> Result<(), PcscError> + Send + Sync + 'static,
    {
        let (failure_tx, failure_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                system,
                config,
                policy,
                callback: Box::new(callback),
                in_flight: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                failure_tx,
            }),
            failure_rx,
            worker: Mutex::new(None),
        }
    }

    /// Channel carrying acquisitions that were given up on
    pub fn failures(&self) -> Receiver<AcquireFailure> {
        self.failure_rx.clone()
    }

    /// Subscribe to the topology monitor and start reacting to card
    /// insertions; a no-op when already running
    pub fn start(&self, monitor: &TopologyMonitor) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("acquisition monitor starting");
        let events = monitor.subscribe();
        let inner = self.inner.clone();
        let handle = thread::spawn(move || dispatch_loop(&inner, &events));
        *self.worker.lock() = Some(handle);
    }

    /// Stop reacting to insertions; attempts already in flight run to
    /// completion
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        debug!("acquisition monitor stopped");
    }
}

impl Drop for AcquireMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(inner: &Arc<Inner>, events: &Receiver<TopologyEvent>) {
    while inner.running.load(Ordering::Acquire) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(TopologyEvent::CardInserted { terminal, .. })
            | Ok(TopologyEvent::CardChanged { terminal, .. }) => {
                Inner::spawn_attempt(inner, terminal);
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl Inner {
    /// Start an acquisition worker for a terminal, unless one is already
    /// running for it
    fn spawn_attempt(self: &Arc<Self>, terminal: String) {
        if !self.in_flight.lock().insert(terminal.clone()) {
            return;
        }
        let inner = self.clone();
        thread::spawn(move || {
            inner.acquire(&terminal);
            inner.in_flight.lock().remove(&terminal);
        });
    }

    fn acquire(&self, terminal: &str) {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            let Some(card) = self
                .system
                .terminal(terminal)
                .and_then(|terminal| terminal.card())
            else {
                let _ = self
                    .failure_tx
                    .send((terminal.to_string(), PcscError::CardUnavailable));
                return;
            };
            match self.try_once(&card) {
                Ok(connection) => {
                    card.reset_retries();
                    debug!(terminal, connection = connection.id(), "card acquired");
                    if let Err(error) = (self.callback)(&connection) {
                        warn!(terminal, error = %error, "ready callback failed");
                        connection.force_close();
                    }
                    return;
                }
                Err(error) => {
                    let attempt = card.record_retry();
                    match self.policy.decide(error.kind(), attempt) {
                        RetryDecision::Retry(delay) => {
                            debug!(terminal, error = %error, ?delay, "acquisition retry");
                            thread::sleep(delay);
                        }
                        RetryDecision::GiveUp => {
                            debug!(terminal, error = %error, "acquisition abandoned");
                            let _ = self.failure_tx.send((terminal.to_string(), error));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One connect-plus-transaction attempt.
    ///
    /// The transaction begin can fail after the connect committed; the
    /// fresh connection is closed again so the attempt leaves nothing
    /// behind.
    fn try_once(&self, card: &Arc<Card>) -> Result<Arc<Connection>, PcscError> {
        let connection = card.connect_shared(&self.config)?;
        if let Err(error) = connection.begin_transaction() {
            connection.force_close();
            return Err(error);
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::testutil::MockProvider;

    const READER: &str = "Mock Reader 0";

    fn harness<F>(provider: Arc<MockProvider>, callback: F) -> (Arc<CardSystem>, AcquireMonitor)
    where
        F: Fn(&Arc<Connection>) -> Result<(), PcscError> + Send + Sync + 'static,
    {
        let system = CardSystem::new(provider);
        let terminal = system.ensure_terminal(READER);
        let _ = terminal.install_card(vec![0x3B, 0x00]);
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let monitor = AcquireMonitor::new(
            system.clone(),
            ConnectConfig::default(),
            policy,
            callback,
        );
        monitor.inner.running.store(true, Ordering::Release);
        (system, monitor)
    }

    #[test]
    fn test_transient_failure_retried_then_acquired() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        provider.script_connect_error(PcscError::SharingViolation);
        let (ready_tx, ready_rx) = unbounded();
        let (system, monitor) = harness(provider.clone(), move |connection: &Arc<Connection>| {
            ready_tx.send(connection.clone()).unwrap();
            Ok(())
        });

        monitor.inner.acquire(READER);

        let connection = ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(connection.transaction_active());
        assert_eq!(provider.connect_calls(), 2);
        // success resets the card's attempt counter
        let card = system.terminal(READER).unwrap().card().unwrap();
        assert_eq!(card.retry_attempts(), 0);
    }

    #[test]
    fn test_nonretryable_failure_reported_once() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        provider.script_connect_error(PcscError::CardUnavailable);
        let (_system, monitor) = harness(provider.clone(), |_| Ok(()));

        monitor.inner.acquire(READER);

        let (terminal, error) = monitor
            .failures()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(terminal, READER);
        assert_eq!(error, PcscError::CardUnavailable);
        assert_eq!(provider.connect_calls(), 1);
    }

    #[test]
    fn test_bounded_retries_then_give_up() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        for _ in 0..3 {
            provider.script_connect_error(PcscError::SharingViolation);
        }
        let (_system, monitor) = harness(provider.clone(), |_| Ok(()));

        monitor.inner.acquire(READER);

        let (_, error) = monitor
            .failures()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(error, PcscError::SharingViolation);
        // initial attempt plus two retries
        assert_eq!(provider.connect_calls(), 3);
    }

    #[test]
    fn test_begin_failure_undoes_connect() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        provider.script_begin_transaction_error(PcscError::Provider {
            code: 0x8010_0068,
            message: "reset before begin".into(),
        });
        let (ready_tx, ready_rx) = unbounded();
        let (_system, monitor) = harness(provider.clone(), move |connection: &Arc<Connection>| {
            ready_tx.send(connection.clone()).unwrap();
            Ok(())
        });

        monitor.inner.acquire(READER);

        let connection = ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(connection.transaction_active());
        // the half-acquired first connection was closed, not leaked
        assert_eq!(provider.connect_calls(), 2);
        assert_eq!(provider.close_calls(), 1);
    }

    #[test]
    fn test_callback_error_closes_connection() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        let (_system, monitor) =
            harness(provider.clone(), |_| Err(PcscError::InvalidState("nope")));

        monitor.inner.acquire(READER);

        provider.wait_for_close_calls(1, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_card_reports_unavailable() {
        let provider = Arc::new(MockProvider::new(&[READER]));
        let (system, monitor) = harness(provider.clone(), |_| Ok(()));
        system.terminal(READER).unwrap().remove_card();

        monitor.inner.acquire(READER);

        let (_, error) = monitor
            .failures()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(error, PcscError::CardUnavailable);
        assert_eq!(provider.connect_calls(), 0);
    }
}
