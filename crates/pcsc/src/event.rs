//! Event types and channels for topology and card-state changes
//!
//! All events are fanned out over crossbeam channels. Topology events are
//! produced by a single poll thread, so every subscriber observes them in
//! occurrence order.

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::card::CardState;

/// A change in the set of terminals or the cards inserted in them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A terminal appeared
    TerminalAttached {
        /// Terminal name
        terminal: String,
    },
    /// A terminal disappeared
    TerminalDetached {
        /// Terminal name
        terminal: String,
    },
    /// A card was inserted into an empty terminal
    CardInserted {
        /// Terminal name
        terminal: String,
        /// Raw ATR the card answered with
        atr: Vec<u8>,
    },
    /// The card in a terminal was swapped for a different one
    CardChanged {
        /// Terminal name
        terminal: String,
        /// Raw ATR of the new card
        atr: Vec<u8>,
    },
    /// The card was removed from a terminal
    CardRemoved {
        /// Terminal name
        terminal: String,
    },
}

impl TopologyEvent {
    /// Terminal this event concerns
    pub fn terminal(&self) -> &str {
        match self {
            Self::TerminalAttached { terminal }
            | Self::TerminalDetached { terminal }
            | Self::CardInserted { terminal, .. }
            | Self::CardChanged { terminal, .. }
            | Self::CardRemoved { terminal } => terminal,
        }
    }
}

/// A card lifecycle state transition, observed at terminal level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardStateEvent {
    /// Terminal holding the card
    pub terminal: String,
    /// State before the transition
    pub from: CardState,
    /// State after the transition
    pub to: CardState,
}

/// Sending half of a topology event subscription
pub type TopologyEventSender = Sender<TopologyEvent>;
/// Receiving half of a topology event subscription
pub type TopologyEventReceiver = Receiver<TopologyEvent>;

/// Sending half of a card-state subscription
pub type CardStateEventSender = Sender<CardStateEvent>;
/// Receiving half of a card-state subscription
pub type CardStateEventReceiver = Receiver<CardStateEvent>;

/// Create an unbounded topology event channel
pub fn topology_event_channel() -> (TopologyEventSender, TopologyEventReceiver) {
    unbounded()
}

/// Create an unbounded card-state event channel
pub fn card_state_event_channel() -> (CardStateEventSender, CardStateEventReceiver) {
    unbounded()
}
