//! Utility functions and helpers.
//!
//! Environment variable lookup and the injectable clock.

pub mod clock;
pub mod env;

pub use clock::{Clock, FixedClock, SystemClock};
pub use env::{get_env_with_prefix, parse_env_with_prefix};
