//! Observability for the device client
//!
//! Structured logging through `tracing`, configured from the environment.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
