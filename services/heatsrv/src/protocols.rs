//! Field bus protocols
//!
//! `can` holds the raw CAN 2.0 frame shared by all transports, `elster` the
//! parameter protocol spoken by Stiebel Eltron / Tecalor heat pump controllers.

pub mod can;
pub mod elster;
