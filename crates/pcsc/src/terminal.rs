//! Terminal objects and their card slot

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::card::{Card, CardState};
use crate::event::{
    CardStateEvent, CardStateEventReceiver, CardStateEventSender, card_state_event_channel,
};
use crate::provider::CardProvider;

/// Lifecycle state of a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// The terminal is attached and usable
    Connected,
    /// The terminal was detached; the object is permanently dead
    Invalid,
}

/// An attached card terminal.
///
/// A terminal holds at most one live [`Card`] at a time. Installing a new
/// card fully disposes the previous one first, and detaching the terminal
/// invalidates its card before the terminal itself.
pub struct Terminal {
    name: String,
    provider: Arc<dyn CardProvider>,
    state: Mutex<TerminalState>,
    card: Mutex<Option<Arc<Card>>>,
    listeners: Mutex<Vec<CardStateEventSender>>,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("has_card", &self.card.lock().is_some())
            .finish()
    }
}

impl Terminal {
    pub(crate) fn new(name: &str, provider: Arc<dyn CardProvider>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            provider,
            state: Mutex::new(TerminalState::Connected),
            card: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Name the provider knows this terminal by
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> TerminalState {
        *self.state.lock()
    }

    /// Card currently installed, if any
    pub fn card(&self) -> Option<Arc<Card>> {
        self.card.lock().clone()
    }

    /// Subscribe to card state transitions on this terminal
    pub fn subscribe_card_state(&self) -> CardStateEventReceiver {
        let (tx, rx) = card_state_event_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Install a freshly observed card, replacing any previous one.
    ///
    /// The old card is disposed before the new object becomes visible, so
    /// observers never see two live cards on the same terminal.
    pub(crate) fn install_card(self: &Arc<Self>, atr: Vec<u8>) -> Arc<Card> {
        let old = self.card.lock().take();
        if let Some(old) = old {
            old.dispose();
        }
        let card = Card::new(self.provider.clone(), self, atr);
        *self.card.lock() = Some(card.clone());
        card.activate();
        card
    }

    /// Dispose the installed card after a removal observation
    pub(crate) fn remove_card(&self) {
        let old = self.card.lock().take();
        if let Some(old) = old {
            old.dispose();
        }
    }

    /// Invalidate the terminal after it detached
    pub(crate) fn dispose(&self) {
        if *self.state.lock() == TerminalState::Invalid {
            return;
        }
        // the card dies first, then the terminal itself
        self.remove_card();
        *self.state.lock() = TerminalState::Invalid;
        debug!(terminal = %self.name, "terminal invalidated");
    }

    pub(crate) fn notify_card_state(&self, from: CardState, to: CardState) {
        let event = CardStateEvent {
            terminal: self.name.clone(),
            from,
            to,
        };
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}
