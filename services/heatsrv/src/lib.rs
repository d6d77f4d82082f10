//! heatsrv - Elster CAN bus to MQTT gateway
//!
//! Reads heat-pump parameters over the Elster protocol on a CAN bus (USBtin
//! SLCAN adapter) and publishes them to an MQTT broker.
//!
//! - [`protocols`]: CAN frames, Elster codec, value types and parameter table
//! - [`transport`]: frame transport trait, SLCAN serial transport, mock
//! - [`gateway`]: request correlation, module scanning, passive capture
//! - [`publisher`]: reading cache, publish queue, broker connection management
//! - [`service`]: periodic polling of configured readings

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocols;
pub mod publisher;
pub mod service;
pub mod transport;

pub use error::{HeatSrvError, Result};
