//! Observability for the bridge
//!
//! Structured logging through `tracing`, plus the span macros used around
//! connection, publish and consume operations.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingConfig};

pub use logging::{connection_span, consume_span, lifecycle_span, publish_span};
