//! Scripted provider for unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use cardlink_core::Protocol;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::error::PcscError;
use crate::provider::{
    AttributeId, CardProvider, Disposition, ProtocolSet, ProviderConnection, ShareMode,
    StatusChange, TerminalStatus,
};

/// Opens a gated connect call when triggered
pub(crate) struct Gate {
    tx: Sender<()>,
}

impl Gate {
    pub(crate) fn open(&self) {
        let _ = self.tx.send(());
    }
}

/// Provider whose every behavior is scripted from the test body
pub(crate) struct MockProvider {
    terminals: Mutex<Vec<String>>,
    connect_gate: Mutex<Option<Receiver<()>>>,
    connect_errors: Mutex<VecDeque<PcscError>>,
    connect_calls: AtomicUsize,
    close_calls: Arc<AtomicUsize>,
    begin_calls: Arc<AtomicUsize>,
    attribute_calls: Arc<AtomicUsize>,
    transmit_script: Arc<Mutex<VecDeque<Vec<u8>>>>,
    begin_gate: Arc<Mutex<Option<Receiver<()>>>>,
    begin_transaction_errors: Arc<Mutex<VecDeque<PcscError>>>,
    end_transaction_errors: Arc<Mutex<VecDeque<PcscError>>>,
    attribute_errors: Arc<Mutex<VecDeque<PcscError>>>,
}

impl MockProvider {
    pub(crate) fn new(terminals: &[&str]) -> Self {
        Self {
            terminals: Mutex::new(terminals.iter().map(|t| t.to_string()).collect()),
            connect_gate: Mutex::new(None),
            connect_errors: Mutex::new(VecDeque::new()),
            connect_calls: AtomicUsize::new(0),
            close_calls: Arc::new(AtomicUsize::new(0)),
            begin_calls: Arc::new(AtomicUsize::new(0)),
            attribute_calls: Arc::new(AtomicUsize::new(0)),
            transmit_script: Arc::new(Mutex::new(VecDeque::new())),
            begin_gate: Arc::new(Mutex::new(None)),
            begin_transaction_errors: Arc::new(Mutex::new(VecDeque::new())),
            end_transaction_errors: Arc::new(Mutex::new(VecDeque::new())),
            attribute_errors: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Make the next connect call block until the returned gate opens
    pub(crate) fn gate_next_connect(&self) -> Gate {
        let (tx, rx) = unbounded();
        *self.connect_gate.lock() = Some(rx);
        Gate { tx }
    }

    /// Make the next begin-transaction call block until the returned
    /// gate opens
    pub(crate) fn gate_next_begin_transaction(&self) -> Gate {
        let (tx, rx) = unbounded();
        *self.begin_gate.lock() = Some(rx);
        Gate { tx }
    }

    pub(crate) fn script_connect_error(&self, error: PcscError) {
        self.connect_errors.lock().push_back(error);
    }

    pub(crate) fn script_transmit(&self, response: Vec<u8>) {
        self.transmit_script.lock().push_back(response);
    }

    pub(crate) fn script_begin_transaction_error(&self, error: PcscError) {
        self.begin_transaction_errors.lock().push_back(error);
    }

    pub(crate) fn script_end_transaction_error(&self, error: PcscError) {
        self.end_transaction_errors.lock().push_back(error);
    }

    pub(crate) fn script_attribute_error(&self, error: PcscError) {
        self.attribute_errors.lock().push_back(error);
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_for_begin_calls(&self, wanted: usize, timeout: Duration) {
        wait_for(&self.begin_calls, wanted, timeout, "begin_transaction");
    }

    pub(crate) fn wait_for_close_calls(&self, wanted: usize, timeout: Duration) {
        wait_for(&self.close_calls, wanted, timeout, "close");
    }

    pub(crate) fn wait_for_attribute_calls(&self, wanted: usize, timeout: Duration) {
        wait_for(&self.attribute_calls, wanted, timeout, "get_attribute");
    }
}

fn wait_for(counter: &AtomicUsize, wanted: usize, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while counter.load(Ordering::SeqCst) < wanted {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {wanted} {what} call(s)"
        );
        thread::sleep(Duration::from_millis(5));
    }
}

impl CardProvider for MockProvider {
    fn list_terminals(&self) -> Result<Vec<String>, PcscError> {
        Ok(self.terminals.lock().clone())
    }

    fn connect(
        &self,
        terminal: &str,
        _share_mode: ShareMode,
        _protocols: ProtocolSet,
    ) -> Result<Box<dyn ProviderConnection>, PcscError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.connect_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if !self.terminals.lock().iter().any(|name| name == terminal) {
            return Err(PcscError::UnknownTerminal(terminal.to_string()));
        }
        if let Some(error) = self.connect_errors.lock().pop_front() {
            return Err(error);
        }
        Ok(Box::new(MockConnection {
            closed: false,
            close_calls: self.close_calls.clone(),
            begin_calls: self.begin_calls.clone(),
            attribute_calls: self.attribute_calls.clone(),
            transmit_script: self.transmit_script.clone(),
            begin_gate: self.begin_gate.clone(),
            begin_transaction_errors: self.begin_transaction_errors.clone(),
            end_transaction_errors: self.end_transaction_errors.clone(),
            attribute_errors: self.attribute_errors.clone(),
        }))
    }

    fn status(
        &self,
        _terminal: &str,
        _last_known: &TerminalStatus,
        _timeout: Duration,
    ) -> Result<StatusChange, PcscError> {
        Ok(StatusChange::Timeout)
    }

    fn cancel_status_wait(&self) {}
}

struct MockConnection {
    closed: bool,
    close_calls: Arc<AtomicUsize>,
    begin_calls: Arc<AtomicUsize>,
    attribute_calls: Arc<AtomicUsize>,
    transmit_script: Arc<Mutex<VecDeque<Vec<u8>>>>,
    begin_gate: Arc<Mutex<Option<Receiver<()>>>>,
    begin_transaction_errors: Arc<Mutex<VecDeque<PcscError>>>,
    end_transaction_errors: Arc<Mutex<VecDeque<PcscError>>>,
    attribute_errors: Arc<Mutex<VecDeque<PcscError>>>,
}

impl ProviderConnection for MockConnection {
    fn protocol(&self) -> Protocol {
        Protocol::T1
    }

    fn begin_transaction(&mut self) -> Result<(), PcscError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.begin_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        match self.begin_transaction_errors.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn end_transaction(&mut self, _disposition: Disposition) -> Result<(), PcscError> {
        match self.end_transaction_errors.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>, PcscError> {
        Ok(self
            .transmit_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![0x90, 0x00]))
    }

    fn control(
        &mut self,
        _code: u32,
        _data: &[u8],
        _out_capacity: usize,
    ) -> Result<Vec<u8>, PcscError> {
        Ok(Vec::new())
    }

    fn get_attribute(&mut self, _id: AttributeId) -> Result<Vec<u8>, PcscError> {
        self.attribute_calls.fetch_add(1, Ordering::SeqCst);
        match self.attribute_errors.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(vec![0x3B, 0x00]),
        }
    }

    fn close(&mut self, _disposition: Disposition) -> Result<(), PcscError> {
        assert!(!self.closed, "provider handle closed twice");
        self.closed = true;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
