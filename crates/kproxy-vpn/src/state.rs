//! Connection State Machine
//!
//! Serializes user actions (connect, rotate IP, disconnect) against the
//! connection manager and publishes the observable state.
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──rotate──▶ Rotating
//!        ▲                        │                  ▲                    │
//!        │                        └──err──▶ Error ◀──┼───────err──────────┘
//!        │                                   │       └────────ok──────────┘
//!        └──────── Disconnecting ◀──disconnect (from any state)
//! ```
//!
//! `Error` is not terminal: connect and rotate are accepted from it.

use crate::config::ProxyConfiguration;
use crate::manager::ProxyConnectionManager;
use crate::probe::{self, SpeedTestResult};
use crate::rotator::NetworkRotator;
use std::fmt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Rotating,
    Disconnecting,
    /// Last operation failed with this message
    Error(String),
}

/// User action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    RotateIp,
    Disconnect,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error(message) => Some(message),
            _ => None,
        }
    }

    /// State entered when `event` starts, or `None` if it is not allowed here
    pub fn on(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected | Error(_), Connect) => Some(Connecting),
            (Connected | Error(_), RotateIp) => Some(Rotating),
            (_, Disconnect) => Some(Disconnecting),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Rotating => f.write_str("rotating"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Error(message) => write!(f, "error: {}", message),
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionEvent::Connect => "connect",
            ConnectionEvent::RotateIp => "rotate IP",
            ConnectionEvent::Disconnect => "disconnect",
        })
    }
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Cannot {event} while {state}")]
    InvalidTransition {
        state: ConnectionState,
        event: ConnectionEvent,
    },

    /// The operation ran and failed; the state now carries the message
    #[error("{0}")]
    Failed(String),
}

/// Drives a [`ProxyConnectionManager`] through user actions
pub struct ConnectionStateMachine {
    manager: Mutex<ProxyConnectionManager>,
    rotator: NetworkRotator,
    state: watch::Sender<ConnectionState>,
    current_ip: watch::Sender<Option<String>>,
    last_speed: watch::Sender<Option<SpeedTestResult>>,
}

impl ConnectionStateMachine {
    pub fn new(manager: ProxyConnectionManager, rotator: NetworkRotator) -> Self {
        Self {
            manager: Mutex::new(manager),
            rotator,
            state: watch::Sender::new(ConnectionState::Disconnected),
            current_ip: watch::Sender::new(None),
            last_speed: watch::Sender::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Body of the last successful IP check
    pub fn current_ip(&self) -> Option<String> {
        self.current_ip.borrow().clone()
    }

    pub fn subscribe_ip(&self) -> watch::Receiver<Option<String>> {
        self.current_ip.subscribe()
    }

    pub fn last_speed(&self) -> Option<SpeedTestResult> {
        *self.last_speed.borrow()
    }

    pub fn manager(&self) -> &Mutex<ProxyConnectionManager> {
        &self.manager
    }

    /// Connect, fetch the external IP, then measure speed
    ///
    /// Speed is measured after the state reaches `Connected`; its failure
    /// is logged and does not change the state.
    pub async fn connect(&self, config: ProxyConfiguration) -> Result<(), StateError> {
        let pending = self.begin(ConnectionEvent::Connect)?;

        let mut manager = self.manager.lock().await;
        let outcome = match manager.connect(config).await {
            Ok(()) => manager.get_current_ip().await,
            Err(e) => Err(e),
        };

        let ip = match outcome {
            Ok(ip) => ip,
            Err(e) => {
                // No tunnel may outlive a failed connect
                if manager.has_session() {
                    if let Err(teardown) = manager.disconnect().await {
                        warn!("Cleanup after failed connect: {}", teardown);
                    }
                }
                self.current_ip.send_replace(None);
                return self.fail(&pending, e.to_string());
            }
        };

        info!("Connected, external address: {}", ip.trim());
        self.current_ip.send_replace(Some(ip));
        self.settle(&pending, ConnectionState::Connected);

        let client = manager.client();
        let speed_url = manager.settings().endpoints.speed_test_url.clone();
        drop(manager);

        if let Some(client) = client {
            match probe::measure_speed(&client, &speed_url).await {
                Ok(speed) => {
                    info!("Connection speed: {}", speed);
                    self.last_speed.send_replace(Some(speed));
                }
                Err(e) => warn!("Speed measurement failed: {}", e),
            }
        }
        Ok(())
    }

    /// Cycle the device's transports and refresh the external IP
    pub async fn rotate_ip(&self) -> Result<(), StateError> {
        let pending = self.begin(ConnectionEvent::RotateIp)?;
        let previous = self.current_ip();

        if let Err(e) = self.rotator.rotate_ip().await {
            return self.fail(&pending, e.to_string());
        }

        let ip = match self.manager.lock().await.get_current_ip().await {
            Ok(ip) => ip,
            Err(e) => return self.fail(&pending, e.to_string()),
        };

        let old = previous.as_deref().and_then(probe::parse_ip);
        let new = probe::parse_ip(&ip);
        if old.is_some() && old == new {
            warn!("External address unchanged after rotation: {}", ip.trim());
        } else {
            info!(
                "External address changed: {} -> {}",
                previous.as_deref().map(str::trim).unwrap_or("unknown"),
                ip.trim()
            );
        }

        self.current_ip.send_replace(Some(ip));
        self.settle(&pending, ConnectionState::Connected);
        Ok(())
    }

    /// Tear everything down; always ends `Disconnected`
    pub async fn disconnect(&self) -> Result<(), StateError> {
        let pending = self.begin(ConnectionEvent::Disconnect)?;

        if let Err(e) = self.manager.lock().await.disconnect().await {
            warn!("Disconnect completed with errors: {}", e);
        }

        self.current_ip.send_replace(None);
        self.settle(&pending, ConnectionState::Disconnected);
        Ok(())
    }

    /// Atomically check `event` against the current state and enter the
    /// intermediate state
    fn begin(&self, event: ConnectionEvent) -> Result<ConnectionState, StateError> {
        let mut outcome = None;
        self.state.send_if_modified(|state| match state.on(event) {
            Some(next) => {
                debug!("{} -> {} ({})", state, next, event);
                *state = next.clone();
                outcome = Some(Ok(next));
                true
            }
            None => {
                outcome = Some(Err(StateError::InvalidTransition {
                    state: state.clone(),
                    event,
                }));
                false
            }
        });

        outcome.unwrap_or(Err(StateError::Failed("state unavailable".into())))
    }

    /// Leave `pending` for `next`, unless another action took over meanwhile
    fn settle(&self, pending: &ConnectionState, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == *pending {
                debug!("{} -> {}", state, next);
                *state = next;
                true
            } else {
                debug!("{} superseded by {}, keeping it", pending, state);
                false
            }
        });
    }

    fn fail(&self, pending: &ConnectionState, message: String) -> Result<(), StateError> {
        warn!("Operation failed: {}", message);
        self.settle(pending, ConnectionState::Error(message.clone()));
        Err(StateError::Failed(message))
    }
}
