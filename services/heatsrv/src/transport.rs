//! CAN Bus Transport Layer
//!
//! `traits` defines the outbound interface and error type, `slcan` drives a
//! USBtin adapter over a serial port, `mock` stands in for the bus in tests.

pub mod mock;
pub mod slcan;
pub mod traits;

pub use mock::MockFrameTransport;
pub use slcan::{SlcanConfig, SlcanTransport};
pub use traits::{FrameTransport, TransportError, TransportStats};
