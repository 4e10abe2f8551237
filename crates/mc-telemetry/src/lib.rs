//! Logging bootstrap for the Marcus daemon and tests.

pub mod logging;

pub use logging::{init_logging, init_logging_json};
