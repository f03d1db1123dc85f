//! Mercury node: the process around a [mercury_core::MercuryNode].
//!
//! - [config] reads and writes the YAML node description.
//! - [driver] owns the UDP socket and the clock, and feeds the sans-IO core.
//! - [logging] installs the `tracing` subscriber and the panic hook.
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod util;

pub use mercury_core;
