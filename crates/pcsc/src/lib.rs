//! Concurrent card and terminal lifecycle over an injected PC/SC provider
//!
//! This crate is the stateful half of the cardlink middleware. An
//! application injects a [`CardProvider`] wrapping its platform PC/SC
//! stack, and gets back:
//!
//! - A [`CardSystem`] registry of identity-stable [`Terminal`] and
//!   [`Card`] objects
//! - [`Connection`]s whose commands run through the protocol transmitter
//!   chain from `cardlink-core`, serialized and guarded by a transaction
//!   keep-alive worker
//! - A [`TopologyMonitor`] publishing attach/detach/insert/remove events
//!   in observation order
//! - An [`AcquireMonitor`] that turns each insertion into a ready,
//!   transacted connection, retrying transient failures
//!
//! Lifecycle state only moves forward: disposed cards and detached
//! terminals never come back to life, and every operation on a dead
//! object fails with an invalid-state error instead of touching the
//! platform.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod acquire;
pub mod card;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod monitor;
pub mod provider;
pub mod system;
pub mod terminal;

#[cfg(test)]
pub(crate) mod testutil;

pub use acquire::{AcquireFailure, AcquireMonitor, ReadyCallback};
pub use card::{Card, CardState, ConnectOutcome};
pub use config::{ConnectConfig, KeepAliveConfig, MonitorConfig};
pub use connection::Connection;
pub use error::PcscError;
pub use event::{
    CardStateEvent, CardStateEventReceiver, TopologyEvent, TopologyEventReceiver,
};
pub use monitor::TopologyMonitor;
pub use provider::{
    AttributeId, CardProvider, Disposition, ProtocolSet, ProviderConnection, ShareMode,
    StatusChange, TerminalStatus,
};
pub use system::CardSystem;
pub use terminal::{Terminal, TerminalState};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use cardlink_core::prelude::*;

    pub use crate::acquire::AcquireMonitor;
    pub use crate::card::{Card, CardState};
    pub use crate::config::{ConnectConfig, KeepAliveConfig, MonitorConfig};
    pub use crate::connection::Connection;
    pub use crate::error::PcscError;
    pub use crate::event::{CardStateEvent, TopologyEvent};
    pub use crate::monitor::TopologyMonitor;
    pub use crate::provider::{
        CardProvider, Disposition, ProtocolSet, ProviderConnection, ShareMode, TerminalStatus,
    };
    pub use crate::system::CardSystem;
    pub use crate::terminal::{Terminal, TerminalState};
}
