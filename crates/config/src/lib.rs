//! Configuration module for Firefly
//!
//! Handles loading the `[params]` table from app_config.toml, the application
//! metadata TOML, and validating all tunables before the pipeline starts.

pub mod config;

pub use config::*;
