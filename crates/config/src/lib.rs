//! Configuration module for the UHD scaler daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and startup validation.

pub mod config;

pub use config::*;
