//! Process-scoped registry of terminals

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::PcscError;
use crate::provider::CardProvider;
use crate::terminal::Terminal;

/// Registry tying a provider to identity-stable [`Terminal`] objects.
///
/// Looking up the same terminal name twice yields the same `Arc` for as
/// long as the terminal stays attached, so per-terminal state (the card,
/// its connections, its retry counter) survives across lookups.
pub struct CardSystem {
    provider: Arc<dyn CardProvider>,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
    disposed: AtomicBool,
}

impl fmt::Debug for CardSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSystem")
            .field("terminals", &self.terminals.lock().len())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl CardSystem {
    /// Create a registry over an injected provider
    pub fn new(provider: Arc<dyn CardProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            terminals: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// The injected provider
    pub fn provider(&self) -> &Arc<dyn CardProvider> {
        &self.provider
    }

    /// Names of the terminals the provider currently reports
    pub fn list_terminal_names(&self) -> Result<Vec<String>, PcscError> {
        self.provider.list_terminals()
    }

    /// Snapshot of the registered terminal objects
    pub fn terminals(&self) -> Vec<Arc<Terminal>> {
        self.terminals.lock().values().cloned().collect()
    }

    /// The registered terminal with this name, if any
    pub fn terminal(&self, name: &str) -> Option<Arc<Terminal>> {
        self.terminals.lock().get(name).cloned()
    }

    /// Return the terminal with this name, registering it on first sight.
    ///
    /// A disposed registry accepts no registrations: the returned terminal
    /// is invalid and is not retained, even when this call races the
    /// disposal.
    pub(crate) fn ensure_terminal(&self, name: &str) -> Arc<Terminal> {
        let terminal = self
            .terminals
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Terminal::new(name, self.provider.clone()))
            .clone();
        if self.disposed.load(Ordering::Acquire) {
            self.terminals.lock().remove(name);
            terminal.dispose();
        }
        terminal
    }

    /// Drop and invalidate a detached terminal
    pub(crate) fn drop_terminal(&self, name: &str) {
        let terminal = self.terminals.lock().remove(name);
        if let Some(terminal) = terminal {
            terminal.dispose();
        }
    }

    /// Invalidate every terminal and forget them all.
    ///
    /// Idempotent; later lifecycle calls on objects obtained from this
    /// registry fail with invalid-state errors.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let terminals: Vec<_> = self.terminals.lock().drain().map(|(_, t)| t).collect();
        debug!(count = terminals.len(), "disposing card system");
        for terminal in terminals {
            terminal.dispose();
        }
    }
}

impl Drop for CardSystem {
    fn drop(&mut self) {
        self.dispose();
    }
}
