//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising sessions and the
//! light panel without an MQTT broker.

pub mod mocks;

pub use mocks::*;
