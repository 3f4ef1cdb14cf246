//! CLI-level error taxonomy. Library errors (`tunatap_core::TunnelError`,
//! `tunatap_common::ConfigurationError`) convert into this via `#[from]`;
//! `main` reports it and chooses the process exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Configuration(#[from] tunatap_common::ConfigurationError),

    #[error(transparent)]
    Tunnel(#[from] tunatap_core::TunnelError),

    #[error("no clusters configured")]
    NoClusters,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit code, following the same low-numbers-for-config /
    /// high-numbers-for-runtime convention the workspace's other CLIs use.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Configuration(_) | CliError::NoClusters => 2,
            CliError::Tunnel(_) => 1,
            CliError::Other(_) => 1,
        }
    }
}
