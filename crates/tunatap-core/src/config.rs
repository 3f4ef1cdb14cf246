//! The on-disk tunnel configuration shape: a `clusters[]` list,
//! each naming a bastion and the private endpoints it forwards to, plus
//! process-wide SSH/pool/health/audit settings.
//!
//! The file itself is YAML (the corpus's TOML-based `ConfigLoader` in
//! `tunatap_common::config` doesn't fit verbatim here since the on-disk
//! format is YAML, not TOML) but env-var overrides still layer
//! on top via `figment`, the same `TUNATAP_`-prefixed, double-underscore
//! nesting every other binary in this workspace uses.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunatap_common::ConfigurationError;

/// Which bastion connection strategy a cluster uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BastionType {
    /// This process owns an in-process SSH client against the bastion.
    Standard,
    /// Shell out to the system `ssh` with a `ProxyCommand` through a
    /// jumpbox; tunnel lifetime follows the child process.
    Internal,
}

impl Default for BastionType {
    fn default() -> Self {
        BastionType::Standard
    }
}

/// One private endpoint a cluster exposes, named for operator-facing
/// display (e.g. in `tunatap status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// One `clusters[]` entry: a bastion plus the local port it forwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub region: String,
    #[serde(default)]
    pub ocid: Option<String>,
    #[serde(default)]
    pub bastion_id: Option<String>,
    #[serde(default)]
    pub bastion_type: BastionType,
    #[serde(default)]
    pub jumpbox_ip: Option<String>,
    pub local_port: u16,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl ClusterConfig {
    /// Validates the required fields, including the
    /// conditional requirement that INTERNAL bastions name a jumpbox.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "clusters[].cluster_name".to_string(),
            });
        }
        if self.region.trim().is_empty() {
            return Err(ConfigurationError::MissingField {
                field: "clusters[].region".to_string(),
            });
        }
        if self.local_port == 0 {
            return Err(ConfigurationError::MissingField {
                field: "clusters[].local_port".to_string(),
            });
        }
        if self.bastion_type == BastionType::Internal && self.jumpbox_ip.is_none() {
            return Err(ConfigurationError::MissingField {
                field: "clusters[].jumpbox_ip (required when bastion_type=INTERNAL)".to_string(),
            });
        }
        if self.bastion_type == BastionType::Standard && self.bastion_id.is_none() {
            return Err(ConfigurationError::MissingField {
                field: "clusters[].bastion_id (required when bastion_type=STANDARD)".to_string(),
            });
        }
        Ok(())
    }

    /// The single `(private-ip, port)` target this cluster's tunnel dials.
    /// A session's target is one endpoint per bastion session; the first
    /// configured endpoint is authoritative, since each tunnel owns its own
    /// session.
    pub fn primary_endpoint(&self) -> Option<&EndpointConfig> {
        self.endpoints.first()
    }
}

fn default_pool_size() -> usize {
    5
}
fn default_warmup_count() -> usize {
    2
}
fn default_max_concurrent() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_hours() -> u64 {
    24
}

/// The full on-disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub ssh_private_key_file: Option<PathBuf>,
    #[serde(default)]
    pub use_ephemeral_keys: bool,
    #[serde(default)]
    pub ssh_socks_proxy: Option<String>,
    #[serde(default = "default_pool_size")]
    pub ssh_connection_pool_size: usize,
    #[serde(default = "default_warmup_count")]
    pub ssh_connection_warmup_count: usize,
    #[serde(default = "default_max_concurrent")]
    pub ssh_connection_max_concurrent_use: usize,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub audit_logging: bool,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            ssh_private_key_file: None,
            use_ephemeral_keys: false,
            ssh_socks_proxy: None,
            ssh_connection_pool_size: default_pool_size(),
            ssh_connection_warmup_count: default_warmup_count(),
            ssh_connection_max_concurrent_use: default_max_concurrent(),
            health_endpoint: None,
            audit_logging: default_true(),
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

impl TunnelConfig {
    /// Parses YAML from `path`, then layers `TUNATAP_`-prefixed env
    /// overrides on top (e.g. `TUNATAP_SSH_CONNECTION_POOL_SIZE=8`).
    pub fn load_yaml(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_yaml(&contents)
    }

    /// As [`load_yaml`](Self::load_yaml), but from an in-memory string;
    /// used by tests and by `tunatap config validate` reading from stdin.
    pub fn parse_yaml(contents: &str) -> Result<Self, ConfigurationError> {
        let parsed: TunnelConfig =
            serde_yaml::from_str(contents).map_err(|e| ConfigurationError::ParseError {
                details: e.to_string(),
            })?;

        let figment = Figment::from(Serialized::defaults(parsed)).merge(Env::prefixed("TUNATAP_").split("__"));
        let merged: TunnelConfig = figment.extract().map_err(|e| ConfigurationError::ParseError {
            details: e.to_string(),
        })?;

        merged.validate()?;
        Ok(merged)
    }

    /// Validates every cluster and the bastion-wide SOCKS/health settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for cluster in &self.clusters {
            cluster.validate()?;
        }
        if let Some(endpoint) = &self.health_endpoint {
            let host = endpoint.rsplit_once(':').map(|(h, _)| h).unwrap_or(endpoint);
            let is_loopback = host == "127.0.0.1" || host == "localhost" || host == "::1";
            if !is_loopback {
                return Err(ConfigurationError::InvalidValue {
                    field: "health_endpoint".to_string(),
                    details: format!("must bind loopback, got {endpoint:?}"),
                });
            }
        }
        Ok(())
    }

    /// A representative sample config, used by `tunatap config generate`.
    pub fn example() -> Self {
        Self {
            clusters: vec![ClusterConfig {
                cluster_name: "prod-cluster".to_string(),
                region: "us-ashburn-1".to_string(),
                ocid: Some("ocid1.cluster.oc1.us-ashburn-1.exampleaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()),
                bastion_id: Some("ocid1.bastion.oc1.us-ashburn-1.exampleaaaaaaaaaaaaaaaaaaaaaa".to_string()),
                bastion_type: BastionType::Standard,
                jumpbox_ip: None,
                local_port: 6443,
                endpoints: vec![EndpointConfig {
                    name: "kube-api".to_string(),
                    ip: "10.0.0.5".to_string(),
                    port: 6443,
                }],
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
clusters:
  - cluster_name: prod
    region: us-ashburn-1
    bastion_id: ocid1.bastion.oc1.us-ashburn-1.aaa
    local_port: 6443
    endpoints:
      - name: kube-api
        ip: 10.0.0.5
        port: 6443
"#;

    #[test]
    fn parses_minimal_yaml_with_defaults() {
        let cfg = TunnelConfig::parse_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(cfg.clusters.len(), 1);
        assert_eq!(cfg.ssh_connection_pool_size, 5);
        assert_eq!(cfg.ssh_connection_warmup_count, 2);
        assert_eq!(cfg.ssh_connection_max_concurrent_use, 10);
        assert!(cfg.audit_logging);
        assert_eq!(cfg.cache_ttl_hours, 24);
        assert_eq!(cfg.clusters[0].bastion_type, BastionType::Standard);
    }

    #[test]
    fn missing_local_port_is_rejected() {
        let yaml = r#"
clusters:
  - cluster_name: prod
    region: us-ashburn-1
    bastion_id: ocid1.bastion.oc1.us-ashburn-1.aaa
    local_port: 0
"#;
        let err = TunnelConfig::parse_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingField { .. }));
    }

    #[test]
    fn internal_bastion_without_jumpbox_is_rejected() {
        let yaml = r#"
clusters:
  - cluster_name: prod
    region: us-ashburn-1
    bastion_type: INTERNAL
    local_port: 6443
"#;
        let err = TunnelConfig::parse_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingField { .. }));
    }

    #[test]
    fn non_loopback_health_endpoint_is_rejected() {
        let mut cfg = TunnelConfig {
            clusters: vec![],
            health_endpoint: Some("0.0.0.0:9090".to_string()),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
        cfg.health_endpoint = Some("127.0.0.1:9090".to_string());
        cfg.validate().unwrap();
    }

    #[test]
    fn example_config_round_trips_through_yaml() {
        let example = TunnelConfig::example();
        let yaml = serde_yaml::to_string(&example).unwrap();
        let reparsed = TunnelConfig::parse_yaml(&yaml).unwrap();
        assert_eq!(reparsed.clusters[0].cluster_name, "prod-cluster");
    }

    #[test]
    fn primary_endpoint_is_first_configured() {
        let cfg = TunnelConfig::parse_yaml(SAMPLE_YAML).unwrap();
        let primary = cfg.clusters[0].primary_endpoint().unwrap();
        assert_eq!(primary.ip, "10.0.0.5");
    }
}
