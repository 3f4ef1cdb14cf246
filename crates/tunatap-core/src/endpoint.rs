//! `Endpoint` — a `(host, port)` value type, the unit the rest of the
//! tunnel-plane reasons about when naming a dial target.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A network endpoint. Port `0` means "bind ephemeral" when used as a local
/// bind target; it is never a valid dial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when this endpoint names the ephemeral-bind sentinel port.
    pub fn is_ephemeral_bind(&self) -> bool {
        self.port == 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse errors for `Endpoint::from_str`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("expected host:port, got {0:?}")]
    MissingSeparator(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| EndpointParseError::MissingSeparator(s.to_string()))?;
            let host = rest[..end].to_string();
            let port_str = rest[end + 1..]
                .strip_prefix(':')
                .ok_or_else(|| EndpointParseError::MissingSeparator(s.to_string()))?;
            let port = port_str
                .parse::<u16>()
                .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
            (host, port)
        } else {
            let (host, port_str) = s
                .rsplit_once(':')
                .ok_or_else(|| EndpointParseError::MissingSeparator(s.to_string()))?;
            let port = port_str
                .parse::<u16>()
                .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
            (host.to_string(), port)
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }

        Ok(Self { host, port })
    }
}
