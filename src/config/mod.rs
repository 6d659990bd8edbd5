//! Configuration management module
//!
//! TOML-based configuration for the control plane.

mod config;

pub use config::*;
