//! Brewcore firmware library.
//!
//! Core of a dual-MCU espresso-machine controller: a control MCU owns the
//! boilers, pumps, and sensors; a display MCU owns UI and networking. The
//! two are joined by a single serial link carrying a framed protocol that
//! doubles as the firmware-update transport.
//!
//! Exposes the pure-logic modules for integration testing and external
//! inspection. Hardware-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` or injected through the port traits in
//! [`hal`].

#![deny(unused_must_use)]

pub mod boot;
pub mod config;
pub mod control;
pub mod controller;
pub mod device;
pub mod display;
pub mod error;
pub mod hal;
pub mod machine;
pub mod meter;
pub mod proto;
pub mod safety;
pub mod sensors;
pub mod status;
