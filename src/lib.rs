//! Reflow oven controller core.
//!
//! Hardware independent part of the oven firmware: thermocouple handling,
//! PID loop, zero-crossing heater switching, wear-levelled flash storage and
//! the solder profile runner. The RP2040 binary in `main.rs` wires these to
//! the actual peripherals.
#![cfg_attr(not(test), no_std)]

pub mod debounce;
pub mod heater;
pub mod pid;
pub mod profile;
pub mod runner;
pub mod settings;
pub mod storage;
pub mod temperature;
pub mod thermocouple;
pub mod tools;
