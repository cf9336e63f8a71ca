//! Topology monitor: polls the provider and publishes ordered events
//!
//! A single poll thread owns all observation, which is what makes the
//! ordering guarantee cheap: events reach every subscriber in the order
//! the poll thread derived them, with the registry already updated when
//! each event is published.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::MonitorConfig;
use crate::event::{
    TopologyEvent, TopologyEventReceiver, TopologyEventSender, topology_event_channel,
};
use crate::provider::{StatusChange, TerminalStatus};
use crate::system::CardSystem;

/// Watches the terminal set and card presence, keeping the
/// [`CardSystem`] registry synchronized and fanning out
/// [`TopologyEvent`]s.
///
/// `start` and `stop` are idempotent and may be alternated freely; a
/// restart re-observes the world from scratch, so terminals that were
/// already attached are announced again.
pub struct TopologyMonitor {
    system: Arc<CardSystem>,
    config: MonitorConfig,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscribers: Arc<Mutex<Vec<TopologyEventSender>>>,
}

impl std::fmt::Debug for TopologyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyMonitor")
            .field("running", &self.running.load(Ordering::Acquire))
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl TopologyMonitor {
    /// Create a monitor over a registry; polling starts with
    /// [`TopologyMonitor::start`]
    pub fn new(system: Arc<CardSystem>, config: MonitorConfig) -> Self {
        Self {
            system,
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to topology events.
    ///
    /// Subscriptions made before `start` observe the initial sweep, which
    /// announces everything already attached.
    pub fn subscribe(&self) -> TopologyEventReceiver {
        let (tx, rx) = topology_event_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Start the poll thread; a no-op when already running
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("topology monitor starting");
        let system = self.system.clone();
        let running = self.running.clone();
        let subscribers = self.subscribers.clone();
        let config = self.config;
        let handle = thread::spawn(move || poll_loop(&system, &running, &subscribers, config));
        *self.worker.lock() = Some(handle);
    }

    /// Stop the poll thread and wait for it to exit; a no-op when already
    /// stopped
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.system.provider().cancel_status_wait();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        debug!("topology monitor stopped");
    }
}

impl Drop for TopologyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emit(subscribers: &Mutex<Vec<TopologyEventSender>>, event: TopologyEvent) {
    trace!(?event, "topology event");
    subscribers
        .lock()
        .retain(|subscriber| subscriber.send(event.clone()).is_ok());
}

fn poll_loop(
    system: &Arc<CardSystem>,
    running: &Arc<AtomicBool>,
    subscribers: &Mutex<Vec<TopologyEventSender>>,
    config: MonitorConfig,
) {
    // last observed status per terminal; local to the thread so a restart
    // re-synchronizes from nothing
    let mut known: BTreeMap<String, TerminalStatus> = BTreeMap::new();
    while running.load(Ordering::Acquire) {
        // a failed enumeration says nothing about the topology; keep the
        // last known picture and try again next tick
        let names = match system.provider().list_terminals() {
            Ok(names) => names,
            Err(error) => {
                debug!(error = %error, "terminal enumeration failed");
                thread::sleep(config.poll_interval);
                continue;
            }
        };

        let detached: Vec<String> = known
            .keys()
            .filter(|name| !names.iter().any(|n| n == *name))
            .cloned()
            .collect();
        for name in detached {
            let last = known.remove(&name);
            system.drop_terminal(&name);
            // card removal is observable before the terminal goes away
            if last.as_ref().is_some_and(TerminalStatus::has_card) {
                emit(subscribers, TopologyEvent::CardRemoved {
                    terminal: name.clone(),
                });
            }
            emit(subscribers, TopologyEvent::TerminalDetached { terminal: name });
        }

        for name in &names {
            if !known.contains_key(name) {
                let _ = system.ensure_terminal(name);
                known.insert(name.clone(), TerminalStatus::Unknown);
                emit(subscribers, TopologyEvent::TerminalAttached {
                    terminal: name.clone(),
                });
            }
        }

        for name in &names {
            let last = known.get(name).cloned().unwrap_or(TerminalStatus::Unknown);
            match system.provider().status(name, &last, config.status_timeout) {
                Ok(StatusChange::Timeout) => {}
                Ok(StatusChange::Changed(current)) => {
                    apply_card_change(system, subscribers, name, &last, &current);
                    known.insert(name.clone(), current);
                }
                Err(error) => {
                    debug!(terminal = %name, error = %error, "status query failed");
                }
            }
        }

        thread::sleep(config.poll_interval);
    }
}

fn apply_card_change(
    system: &Arc<CardSystem>,
    subscribers: &Mutex<Vec<TopologyEventSender>>,
    name: &str,
    last: &TerminalStatus,
    current: &TerminalStatus,
) {
    match (last.has_card(), current.has_card()) {
        (false, true) => {
            let atr = current.atr().unwrap_or_default().to_vec();
            trace!(terminal = %name, atr = %hex::encode(&atr), "card inserted");
            if let Some(terminal) = system.terminal(name) {
                let _ = terminal.install_card(atr.clone());
            }
            emit(subscribers, TopologyEvent::CardInserted {
                terminal: name.to_string(),
                atr,
            });
        }
        (true, false) => {
            if let Some(terminal) = system.terminal(name) {
                terminal.remove_card();
            }
            emit(subscribers, TopologyEvent::CardRemoved {
                terminal: name.to_string(),
            });
        }
        (true, true) if last.atr() != current.atr() => {
            let atr = current.atr().unwrap_or_default().to_vec();
            trace!(terminal = %name, atr = %hex::encode(&atr), "card swapped");
            if let Some(terminal) = system.terminal(name) {
                let _ = terminal.install_card(atr.clone());
            }
            emit(subscribers, TopologyEvent::CardChanged {
                terminal: name.to_string(),
                atr,
            });
        }
        _ => {}
    }
}
