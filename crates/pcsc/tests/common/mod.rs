//! Scripted provider driving the monitors through the public API

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cardlink_core::Protocol;
use cardlink_pcsc::{
    AttributeId, CardProvider, Disposition, PcscError, ProtocolSet, ProviderConnection, ShareMode,
    StatusChange, TerminalStatus,
};
use parking_lot::Mutex;

/// Provider whose terminal list and per-terminal status observations are
/// scripted from the test body; each status pushed is reported exactly
/// once, then the terminal reports no change.
pub struct ScriptedProvider {
    terminals: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, VecDeque<TerminalStatus>>>,
    list_errors: Mutex<VecDeque<PcscError>>,
    connect_errors: Mutex<VecDeque<PcscError>>,
    connect_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(terminals: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            terminals: Mutex::new(terminals.iter().map(|t| t.to_string()).collect()),
            statuses: Mutex::new(HashMap::new()),
            list_errors: Mutex::new(VecDeque::new()),
            connect_errors: Mutex::new(VecDeque::new()),
            connect_calls: AtomicUsize::new(0),
        })
    }

    /// Replace the attached terminal set
    pub fn set_terminals(&self, terminals: &[&str]) {
        *self.terminals.lock() = terminals.iter().map(|t| t.to_string()).collect();
    }

    /// Queue one status observation for a terminal
    pub fn push_status(&self, terminal: &str, status: TerminalStatus) {
        self.statuses
            .lock()
            .entry(terminal.to_string())
            .or_default()
            .push_back(status);
    }

    /// Queue one terminal enumeration failure
    pub fn script_list_error(&self, error: PcscError) {
        self.list_errors.lock().push_back(error);
    }

    /// Queue one connect failure
    pub fn script_connect_error(&self, error: PcscError) {
        self.connect_errors.lock().push_back(error);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

impl CardProvider for ScriptedProvider {
    fn list_terminals(&self) -> Result<Vec<String>, PcscError> {
        if let Some(error) = self.list_errors.lock().pop_front() {
            return Err(error);
        }
        Ok(self.terminals.lock().clone())
    }

    fn connect(
        &self,
        terminal: &str,
        _share_mode: ShareMode,
        _protocols: ProtocolSet,
    ) -> Result<Box<dyn ProviderConnection>, PcscError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.terminals.lock().iter().any(|name| name == terminal) {
            return Err(PcscError::UnknownTerminal(terminal.to_string()));
        }
        if let Some(error) = self.connect_errors.lock().pop_front() {
            return Err(error);
        }
        Ok(Box::new(ScriptedConnection))
    }

    fn status(
        &self,
        terminal: &str,
        _last_known: &TerminalStatus,
        _timeout: Duration,
    ) -> Result<StatusChange, PcscError> {
        match self
            .statuses
            .lock()
            .get_mut(terminal)
            .and_then(VecDeque::pop_front)
        {
            Some(status) => Ok(StatusChange::Changed(status)),
            None => Ok(StatusChange::Timeout),
        }
    }

    fn cancel_status_wait(&self) {}
}

struct ScriptedConnection;

impl ProviderConnection for ScriptedConnection {
    fn protocol(&self) -> Protocol {
        Protocol::T1
    }

    fn begin_transaction(&mut self) -> Result<(), PcscError> {
        Ok(())
    }

    fn end_transaction(&mut self, _disposition: Disposition) -> Result<(), PcscError> {
        Ok(())
    }

    fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>, PcscError> {
        Ok(vec![0x90, 0x00])
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
        Ok(vec![0x3B, 0x00])
    }

    fn close(&mut self, _disposition: Disposition) -> Result<(), PcscError> {
        Ok(())
    }
}
