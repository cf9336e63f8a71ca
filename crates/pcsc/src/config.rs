//! Configuration for connections and monitoring

use std::time::Duration;

use crate::provider::{Disposition, ProtocolSet, ShareMode};

/// Keep-alive worker settings for transacted connections.
///
/// The platform resets a card that sits idle inside a transaction for
/// about five seconds, so the defaults check every second and ping once
/// the connection has been quiet for four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How often the worker wakes up to check idle time
    pub interval: Duration,
    /// Idle time after which a ping is issued
    pub max_idle: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_idle: Duration::from_secs(4),
        }
    }
}

/// Settings applied when opening a connection to a card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Sharing semantics requested from the provider
    pub share_mode: ShareMode,
    /// Protocols acceptable during negotiation
    pub protocols: ProtocolSet,
    /// Disposition applied when the connection closes
    pub disposition: Disposition,
    /// How long a blocking connect waits for the in-flight attempt
    pub connect_timeout: Duration,
    /// Keep-alive behavior while a transaction is active
    pub keep_alive: KeepAliveConfig,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocols: ProtocolSet::ANY,
            disposition: Disposition::Leave,
            connect_timeout: Duration::from_secs(10),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl ConnectConfig {
    /// Set the sharing semantics
    #[must_use]
    pub const fn with_share_mode(mut self, share_mode: ShareMode) -> Self {
        self.share_mode = share_mode;
        self
    }

    /// Set the acceptable protocols
    #[must_use]
    pub const fn with_protocols(mut self, protocols: ProtocolSet) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set the close disposition
    #[must_use]
    pub const fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    /// Set the blocking-connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keep-alive behavior
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Settings for the topology poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Pause between poll cycles
    pub poll_interval: Duration,
    /// Bounded wait passed to each per-terminal status query
    pub status_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            status_timeout: Duration::from_millis(100),
        }
    }
}

impl MonitorConfig {
    /// Set the pause between poll cycles
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-terminal status wait
    #[must_use]
    pub const fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }
}
