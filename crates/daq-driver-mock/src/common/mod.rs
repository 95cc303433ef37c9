//! Shared infrastructure for the simulated hardware.
//!
//! - **errors**: failure injection with recoverable and fatal scenarios
//! - **rng**: seeded random number generator

pub mod errors;
pub mod rng;

pub use errors::{ErrorConfig, ErrorScenario};
pub use rng::MockRng;
