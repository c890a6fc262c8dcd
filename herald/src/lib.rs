//! herald: rate-limited, retrying notification dispatch
//!
//! This crate is the process shell around [`herald_dispatch`]: it loads
//! `herald.config.ron`, wires a file-backed template renderer and a dry-run
//! transport into the engine, and runs the engine under a controller that
//! handles logging, metrics, cache maintenance and shutdown signals.

pub mod config;
pub mod controller;
pub mod render;
pub mod transport;

pub use config::{ConfigError, HeraldConfig, find_config_file};
pub use controller::Herald;
