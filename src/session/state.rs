//! Session lifecycle state and its pure transition rules
//!
//! `Idle -> Connecting -> Connected -> (Reconnecting <-> Connected) -> Closed`
//!
//! Transitions are computed by plain functions so the rules can be tested
//! without a transport. The manager applies them under its session lock.

use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transport and no connection attempt
    #[default]
    Idle,
    /// A connection attempt is in flight, or its transport has not
    /// signalled Connect yet
    Connecting,
    Connected,
    /// The transport lost its connection and is retrying on its own
    Reconnecting,
    /// The logical session ended; a new `connect` starts a fresh one
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `connect` passed validation
    ConnectStarted,
    /// The attempt failed before a transport was installed
    ConnectAborted,
    /// A freshly constructed transport replaced whatever was installed
    TransportInstalled,
    /// Transport signalled Connect
    TransportConnected,
    /// Transport signalled Reconnect or Offline
    TransportInterrupted,
    /// Transport signalled Close
    TransportClosed,
    /// Caller requested `disconnect`
    Disconnected,
}

/// Next state after `transition`, given whether a transport is installed
pub fn next_state(
    current: SessionState,
    transition: Transition,
    has_transport: bool,
) -> SessionState {
    match transition {
        // A live transport keeps reporting its own state until it is replaced
        Transition::ConnectStarted if has_transport => current,
        Transition::ConnectStarted => SessionState::Connecting,
        Transition::ConnectAborted if has_transport => current,
        Transition::ConnectAborted => SessionState::Idle,
        Transition::TransportInstalled => SessionState::Connecting,
        Transition::TransportConnected => SessionState::Connected,
        Transition::TransportInterrupted => match current {
            SessionState::Connected => SessionState::Reconnecting,
            other => other,
        },
        Transition::TransportClosed | Transition::Disconnected => SessionState::Closed,
    }
}

/// Whether `subscribe` may go straight to the transport
pub fn accepts_immediate_subscribe(state: SessionState, has_transport: bool) -> bool {
    has_transport && matches!(state, SessionState::Connected | SessionState::Reconnecting)
}

pub fn log_state_transition(from: SessionState, to: SessionState) {
    if from == to {
        return;
    }
    match (from, to) {
        (SessionState::Connecting, SessionState::Connected) => {
            info!("Session connected");
        }
        (SessionState::Reconnecting, SessionState::Connected) => {
            info!("Session reconnected");
        }
        (SessionState::Connected, SessionState::Reconnecting) => {
            warn!("Session connection interrupted, transport is retrying");
        }
        (SessionState::Connecting, SessionState::Idle) => {
            warn!("Connection attempt aborted");
        }
        (_, SessionState::Closed) => {
            info!(from = %from, "Session closed");
        }
        _ => {
            info!("Session state: {} -> {}", from, to);
        }
    }
}
