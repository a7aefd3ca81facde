//! Testing utilities and mock implementations
//!
//! Fakes for the transport and storage collaborators, so the device client can
//! be exercised without an MQTT broker or a credentials file.

pub mod mocks;

pub use mocks::*;
