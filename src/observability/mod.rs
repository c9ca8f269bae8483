//! Observability for the session manager
//!
//! Structured logging through `tracing`, with span macros for session and
//! transport operations.

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, session_span};
