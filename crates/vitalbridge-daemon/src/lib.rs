//! # vitalbridge-daemon
//!
//! Kiosk process library for the vitalbridge medical device integration layer.
//!
//! This library wires configuration, logging, a Bluetooth transport and a
//! reading sink around [`vitalbridge_core::DeviceService`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod schema;
pub mod simulation;
pub mod sink;
pub mod transport;
