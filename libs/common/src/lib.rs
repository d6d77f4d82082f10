//! Shared service infrastructure for heatsrv
//!
//! Provides the functions every service binary needs before it does any real work:
//! - logging initialization (console + optional daily rolling file)
//! - startup banner and service metadata
//! - shutdown signal handling wired to a cancellation token
//! - serde helpers for hex-or-decimal configuration values

pub mod logging;
pub mod serde_helpers;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::LogConfig;
pub use service_bootstrap::ServiceInfo;
