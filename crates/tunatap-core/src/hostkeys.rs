//! `HostKeyStore` (C3) — trust-on-first-use verification of bastion host
//! keys against a `known_hosts`-style file.
//!
//! The first connection to a given host records its key fingerprint; every
//! subsequent connection must match exactly, or the dial is refused with
//! [`HostKeyError::Mismatch`]. This is deliberately simpler than OpenSSH's
//! own `known_hosts` format: one `host fingerprint` pair per line, since the
//! store only ever has to answer "have I seen this host before, and if so
//! with which key".

use russh_keys::{HashAlg, PublicKey};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("host key for {host} does not match the pinned fingerprint (TOFU mismatch)")]
    Mismatch { host: String },
    #[error("failed to read known-hosts file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write known-hosts file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed known-hosts entry at line {line}: {content:?}")]
    Malformed { line: usize, content: String },
}

/// A trust-on-first-use store of `host -> key fingerprint` pins, backed by
/// a flat file on disk (mode 0600 when created).
pub struct HostKeyStore {
    path: PathBuf,
    pins: Mutex<HashMap<String, String>>,
}

impl HostKeyStore {
    /// Load pins from `path`, creating an empty store if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HostKeyError> {
        let path = path.into();
        let pins = if path.exists() {
            Self::load(&path)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            pins: Mutex::new(pins),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, String>, HostKeyError> {
        let contents = fs::read_to_string(path).map_err(|source| HostKeyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut pins = HashMap::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, ' ');
            let host = parts.next();
            let fingerprint = parts.next();
            match (host, fingerprint) {
                (Some(h), Some(f)) if !h.is_empty() && !f.is_empty() => {
                    pins.insert(h.to_string(), f.to_string());
                }
                _ => {
                    return Err(HostKeyError::Malformed {
                        line: idx + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(pins)
    }

    /// Check `key` against the pin recorded for `host`. If none exists yet,
    /// pin it (trust-on-first-use) and persist the store. Returns an error
    /// only on an actual mismatch or an I/O failure.
    pub fn verify_or_pin(&self, host: &str, key: &PublicKey) -> Result<(), HostKeyError> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let mut pins = self.pins.lock().expect("host key store mutex poisoned");

        match pins.get(host) {
            Some(pinned) if pinned == &fingerprint => Ok(()),
            Some(_) => Err(HostKeyError::Mismatch {
                host: host.to_string(),
            }),
            None => {
                pins.insert(host.to_string(), fingerprint);
                self.persist(&pins)
            }
        }
    }

    /// Fingerprint currently pinned for `host`, if any.
    pub fn pinned_fingerprint(&self, host: &str) -> Option<String> {
        self.pins
            .lock()
            .expect("host key store mutex poisoned")
            .get(host)
            .cloned()
    }

    fn persist(&self, pins: &HashMap<String, String>) -> Result<(), HostKeyError> {
        let mut contents = String::new();
        for (host, fingerprint) in pins {
            contents.push_str(host);
            contents.push(' ');
            contents.push_str(fingerprint);
            contents.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| HostKeyError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        }

        let mut file = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(&self.path)
            }
            #[cfg(not(unix))]
            {
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)
            }
        }
        .map_err(|source| HostKeyError::Write {
            path: self.path.display().to_string(),
            source,
        })?;

        file.write_all(contents.as_bytes())
            .map_err(|source| HostKeyError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }
}
