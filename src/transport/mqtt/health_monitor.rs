//! Pure reconnection decision logic for the MQTT supervisor

use crate::transport::ReconnectBounds;
use std::time::Duration;
use tracing::{error, info};

/// Pure reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what to do after the connection was lost `current_attempts`
    /// times in a row. Unlimited retries when `max_attempts` is None.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        bounds: &ReconnectBounds,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !bounds.allows_attempt(current_attempts) {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: bounds.delay_for_attempt(attempt),
        }
    }

    pub fn log_decision(decision: &ReconnectionDecision, bounds: &ReconnectBounds) {
        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                let max_display = bounds
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt,
                    max_display,
                    delay.as_millis()
                );
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(
                    max_attempts = ?bounds.max_attempts,
                    "Max reconnection attempts exceeded, giving up"
                );
            }
        }
    }
}

/// Reconnection decision result
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}
