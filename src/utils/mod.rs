//! The `utils` module provides definitions shared across the `fanbus` broker:
//! the error types reported on the wire and the logging setup.

pub mod error;
pub mod logging;
