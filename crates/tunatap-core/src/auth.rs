//! `AuthProvider` (C4) — resolves the SSH credential the forwarding engine
//! presents to a bastion: a private key on disk, a running `ssh-agent`, or
//! an ephemeral in-memory keypair generated for the lifetime of a single
//! session and never written to disk.

use russh_keys::{Algorithm, PrivateKey};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("private key file not found at {path}")]
    KeyNotFound { path: String },
    #[error("failed to load private key at {path}: {source}")]
    KeyLoad {
        path: String,
        #[source]
        source: russh_keys::Error,
    },
    #[error("failed to generate ephemeral keypair: {0}")]
    EphemeralGeneration(russh_keys::Error),
    #[error("ssh-agent socket not available (SSH_AUTH_SOCK unset)")]
    AgentUnavailable,
    #[error("no public key blob available to register with the bastion-session provider")]
    NoPublicKeyBlob,
}

/// How the tunnel plane authenticates to a bastion's SSH endpoint.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// A private key file on disk, optionally passphrase-protected.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Delegate signing to a running `ssh-agent` over `SSH_AUTH_SOCK`. The
    /// optional path is the same `key_file_path` the config would otherwise
    /// use for a `KeyFile` method; when present it is read (as `<path>.pub`,
    /// or derived from the private key itself) to produce the registration
    /// blob a bastion-session provider needs, since the agent itself only
    /// offers signing, not key material.
    Agent { key_hint: Option<PathBuf> },
    /// Generate a fresh Ed25519 keypair for this process's lifetime. The
    /// private half is never persisted; only the public half is ever
    /// handed to a bastion-session provider for registration.
    Ephemeral,
}

/// A resolved, ready-to-use signing credential.
pub enum ResolvedCredential {
    /// An in-process keypair `russh` can sign with directly.
    Local(Arc<PrivateKey>),
    /// Defer signing to `ssh-agent`; callers should use
    /// `russh_keys::agent::client::AgentClient` against this socket path.
    Agent {
        socket_path: PathBuf,
        key_hint: Option<PathBuf>,
    },
}

/// Resolves an [`AuthMethod`] into a usable credential. Ephemeral keys are
/// cached for the lifetime of the provider so repeated calls within one
/// process reuse the same identity rather than minting a new one per dial.
pub struct AuthProvider {
    method: AuthMethod,
    ephemeral_cache: std::sync::Mutex<Option<Arc<PrivateKey>>>,
}

impl AuthProvider {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            ephemeral_cache: std::sync::Mutex::new(None),
        }
    }

    /// Resolve the configured method into a credential.
    pub fn resolve(&self) -> Result<ResolvedCredential, AuthError> {
        match &self.method {
            AuthMethod::KeyFile { path, passphrase } => {
                if !path.exists() {
                    return Err(AuthError::KeyNotFound {
                        path: path.display().to_string(),
                    });
                }
                let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|source| {
                    AuthError::KeyLoad {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                Ok(ResolvedCredential::Local(Arc::new(key)))
            }
            AuthMethod::Agent { key_hint } => {
                let socket_path = std::env::var_os("SSH_AUTH_SOCK")
                    .map(PathBuf::from)
                    .ok_or(AuthError::AgentUnavailable)?;
                Ok(ResolvedCredential::Agent {
                    socket_path,
                    key_hint: key_hint.clone(),
                })
            }
            AuthMethod::Ephemeral => {
                let mut cache = self
                    .ephemeral_cache
                    .lock()
                    .expect("auth provider mutex poisoned");
                if let Some(key) = cache.as_ref() {
                    return Ok(ResolvedCredential::Local(key.clone()));
                }
                let key = Arc::new(
                    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
                        .map_err(AuthError::EphemeralGeneration)?,
                );
                *cache = Some(key.clone());
                Ok(ResolvedCredential::Local(key))
            }
        }
    }

    /// Whether repeated [`resolve`](Self::resolve) calls yield the same
    /// identity (key-file and cached-ephemeral), as opposed to delegating
    /// to an external agent whose identity this provider does not own.
    pub fn is_stable_identity(&self) -> bool {
        !matches!(self.method, AuthMethod::Agent { .. })
    }

    /// The OpenSSH-format public-key blob to register with a
    /// bastion-session provider for `credential`. For a local key (file or
    /// ephemeral) this is derived directly; for an agent-backed credential
    /// there is no key material to introspect, so this falls back to
    /// `key_hint.pub` (or, absent a `.pub` sidecar, parsing the public half
    /// out of the private key file itself) per §4.3.
    pub fn public_key_blob(&self, credential: &ResolvedCredential) -> Result<String, AuthError> {
        match credential {
            ResolvedCredential::Local(key) => Ok(format_public_key_blob(key)),
            ResolvedCredential::Agent { key_hint, .. } => {
                let hint = key_hint.as_ref().ok_or(AuthError::NoPublicKeyBlob)?;
                let pub_path = PathBuf::from(format!("{}.pub", hint.display()));
                if let Ok(content) = std::fs::read_to_string(&pub_path) {
                    return Ok(content.trim().to_string());
                }
                let key =
                    russh_keys::load_secret_key(hint, None).map_err(|_| AuthError::NoPublicKeyBlob)?;
                Ok(format_public_key_blob(&key))
            }
        }
    }
}

fn format_public_key_blob(key: &PrivateKey) -> String {
    use russh_keys::PublicKeyBase64;
    format!("ssh-ed25519 {}", key.public_key().public_key_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_missing_is_reported_before_touching_russh_keys() {
        let provider = AuthProvider::new(AuthMethod::KeyFile {
            path: PathBuf::from("/nonexistent/id_ed25519"),
            passphrase: None,
        });
        let err = provider.resolve().unwrap_err();
        assert!(matches!(err, AuthError::KeyNotFound { .. }));
    }

    #[test]
    fn ephemeral_identity_is_cached_across_calls() {
        let provider = AuthProvider::new(AuthMethod::Ephemeral);
        let first = match provider.resolve().unwrap() {
            ResolvedCredential::Local(key) => key.public_key().clone(),
            _ => panic!("expected local credential"),
        };
        let second = match provider.resolve().unwrap() {
            ResolvedCredential::Local(key) => key.public_key().clone(),
            _ => panic!("expected local credential"),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn agent_without_socket_env_is_unavailable() {
        std::env::remove_var("SSH_AUTH_SOCK");
        let provider = AuthProvider::new(AuthMethod::Agent { key_hint: None });
        let err = provider.resolve().unwrap_err();
        assert!(matches!(err, AuthError::AgentUnavailable));
    }

    #[test]
    fn ephemeral_and_key_file_are_stable_but_agent_is_not() {
        assert!(AuthProvider::new(AuthMethod::Ephemeral).is_stable_identity());
        assert!(AuthProvider::new(AuthMethod::KeyFile {
            path: PathBuf::from("/tmp/x"),
            passphrase: None
        })
        .is_stable_identity());
        assert!(!AuthProvider::new(AuthMethod::Agent { key_hint: None }).is_stable_identity());
    }

    #[test]
    fn agent_without_key_hint_has_no_public_key_blob() {
        std::env::set_var("SSH_AUTH_SOCK", "/tmp/fake-agent.sock");
        let provider = AuthProvider::new(AuthMethod::Agent { key_hint: None });
        let credential = provider.resolve().unwrap();
        let err = provider.public_key_blob(&credential).unwrap_err();
        assert!(matches!(err, AuthError::NoPublicKeyBlob));
        std::env::remove_var("SSH_AUTH_SOCK");
    }

    #[test]
    fn agent_with_key_hint_reads_pub_sidecar() {
        std::env::set_var("SSH_AUTH_SOCK", "/tmp/fake-agent.sock");
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        std::fs::write(format!("{}.pub", key_path.display()), "ssh-ed25519 AAAAhintkey user@host\n").unwrap();
        let provider = AuthProvider::new(AuthMethod::Agent {
            key_hint: Some(key_path),
        });
        let credential = provider.resolve().unwrap();
        let blob = provider.public_key_blob(&credential).unwrap();
        assert_eq!(blob, "ssh-ed25519 AAAAhintkey user@host");
        std::env::remove_var("SSH_AUTH_SOCK");
    }
}
