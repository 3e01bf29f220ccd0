//! Configuration module
//!
//! Handles loading and validating service settings.

mod settings;

pub use settings::*;
