//! Shared plumbing for the tunatap workspace: configuration loading, error
//! taxonomy scaffolding, and logging initialization.
//!
//! This crate carries no tunnel-plane logic itself — see `tunatap-core` for
//! that. It exists so the CLI binary and the core library agree on one way
//! to load TOML+env configuration and one way to stand up `tracing`.

pub mod config;
pub mod error;
pub mod logging;

pub use error::ConfigurationError;
