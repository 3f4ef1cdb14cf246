//! Generic figment-backed configuration loading.
//!
//! `ConfigLoader` is the seam every binary-specific `Config` struct
//! implements so that `figment` providers (TOML file + `TUNATAP_`-prefixed
//! env overrides) are wired up the same way everywhere.

use crate::error::ConfigurationError;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Implemented by a crate's top-level `Config` struct to get file+env
/// loading for free.
pub trait ConfigLoader<T>: Sized {
    /// Default file name to look for when no explicit path is given.
    fn default_file_name() -> &'static str;

    /// Env var prefix for overrides, e.g. `"TUNATAP_"`.
    fn env_prefix() -> &'static str;

    /// Load configuration, optionally from an explicit path, falling back to
    /// `default_file_name()` in the current directory.
    fn load(path: Option<PathBuf>) -> Result<T, ConfigurationError>;

    /// Load configuration from a specific file, ignoring `default_file_name`.
    fn load_from_file(path: &Path) -> Result<T, ConfigurationError>;
}

/// Shared figment assembly used by every `ConfigLoader` impl in this repo.
pub fn figment_for<T>(path: Option<&Path>, default_file_name: &str, env_prefix: &str) -> Figment
where
    T: Default + Serialize,
{
    let base = Figment::from(Serialized::defaults(T::default()));
    let with_file = match path {
        Some(p) => base.merge(Toml::file(p)),
        None => base.merge(Toml::file(default_file_name)),
    };
    with_file.merge(Env::prefixed(env_prefix).split("__"))
}

/// Extract a figment into `T`, mapping figment's error into ours.
pub fn extract<T: DeserializeOwned>(figment: Figment) -> Result<T, ConfigurationError> {
    figment
        .extract()
        .map_err(|e| ConfigurationError::ParseError {
            details: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("TESTCFG_PORT", "9090");
        std::env::set_var("TESTCFG_NAME", "hello");
        let figment = figment_for::<Sample>(None, "does-not-exist.toml", "TESTCFG_");
        let sample: Sample = extract(figment).unwrap();
        assert_eq!(sample.port, 9090);
        assert_eq!(sample.name, "hello");
        std::env::remove_var("TESTCFG_PORT");
        std::env::remove_var("TESTCFG_NAME");
    }
}
