//! Bluetooth access layer.
//!
//! This module provides the platform radio adapter and the RFCOMM
//! byte-stream transport used for serial connections.

pub mod adapter;
pub mod transport;
