//! Provides types and functions shared by the dwload binaries.
#![deny(missing_docs)]
pub mod quantity;
#[cfg(feature = "telemetry")]
pub mod telemetry;
