//! `TunnelError` — the domain-level error taxonomy, shared by
//! every component above the leaf error types (`SessionError`, `PoolError`,
//! `HostKeyError`, ...). Leaf errors are enriched with this classification
//! as they cross component boundaries into the `Supervisor`; the original
//! error is preserved via `#[source]` so `anyhow`'s `.context()` chain at
//! the CLI boundary can still print the full cause chain.

use crate::auth::AuthError;
use crate::forwarding::ForwardingError;
use crate::hostkeys::HostKeyError;
use crate::pool::PoolError;
use crate::provider::ProviderError;
use crate::session::SessionError;
use thiserror::Error;

/// The recovery-relevant classification of an error, independent of which
/// Rust type produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network timeout, DNS, connection refused, 429, 5xx: retry with
    /// backoff at the supervisor level.
    Transient,
    /// Session expired or signature mismatch: force a session refresh and
    /// retry once; if it repeats, surface.
    AuthExpired,
    /// Wrong key, 401 NotAuthenticated: surface immediately with a
    /// remediation hint, do not retry.
    AuthRejected,
    /// 403, NotAuthorizedOrNotFound: surface with a policy hint, do not
    /// retry.
    AuthzDenied,
    /// 404: surface immediately.
    NotFound,
    /// Missing required field, bad OCID: surface at startup, no retry.
    ConfigInvalid,
    /// Pool has no capacity: return to caller, the one forward task fails,
    /// the tunnel stays up.
    PoolExhausted,
    /// Listener bind error or too many consecutive accept failures:
    /// terminate the tunnel.
    ListenerFailed,
    /// TOFU mismatch: surface, never append, require operator
    /// intervention.
    HostKeyMismatch,
    /// Context cancellation: clean shutdown, nothing reported to the user.
    Cancelled,
}

impl ErrorKind {
    /// Whether the supervisor's retry loop should attempt this operation
    /// again (subject to the backoff policy's attempt cap).
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::AuthExpired)
    }

    /// A short, user-facing remediation hint. Raw wire errors are never
    /// surfaced past this; `Display` on `TunnelError` includes this hint.
    pub fn remediation(self) -> &'static str {
        match self {
            ErrorKind::Transient => "the operation will be retried automatically",
            ErrorKind::AuthExpired => "the bastion session will be refreshed and retried",
            ErrorKind::AuthRejected => {
                "check that the configured key or agent identity is authorized for this bastion"
            }
            ErrorKind::AuthzDenied => {
                "the identity is not authorized for this target; check IAM/bastion policy bindings"
            }
            ErrorKind::NotFound => "verify the bastion id, target host, and port are correct",
            ErrorKind::ConfigInvalid => "fix the configuration file and restart",
            ErrorKind::PoolExhausted => {
                "the connection pool is at capacity; this connection was dropped, the tunnel stays up"
            }
            ErrorKind::ListenerFailed => "the local listener could not keep accepting connections",
            ErrorKind::HostKeyMismatch => {
                "the bastion's host key changed; verify out-of-band and update known_hosts manually"
            }
            ErrorKind::Cancelled => "shutdown requested",
        }
    }
}

/// Top-level tunnel-plane error. Enriches a leaf error with its
/// [`ErrorKind`] and the operation that was in flight when it occurred.
#[derive(Debug, Error)]
#[error("{operation} failed: {source} ({remediation})", remediation = kind.remediation())]
pub struct TunnelError {
    pub operation: &'static str,
    pub kind: ErrorKind,
    #[source]
    pub source: anyhow::Error,
}

impl TunnelError {
    pub fn new(operation: &'static str, kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            operation,
            kind,
            source: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn remediation(&self) -> &'static str {
        self.kind.remediation()
    }
}

/// Classifies a [`SessionError`] into the domain-level error taxonomy.
pub fn classify_session_error(err: &SessionError) -> ErrorKind {
    match err {
        SessionError::Auth(AuthError::AgentUnavailable)
        | SessionError::Auth(AuthError::KeyNotFound { .. })
        | SessionError::Auth(AuthError::NoPublicKeyBlob) => ErrorKind::ConfigInvalid,
        SessionError::Auth(_) => ErrorKind::AuthRejected,
        SessionError::Provider(ProviderError::BastionNotFound { .. })
        | SessionError::Provider(ProviderError::SessionNotFound { .. }) => ErrorKind::NotFound,
        SessionError::Provider(ProviderError::Timeout)
        | SessionError::Provider(ProviderError::Transport(_)) => ErrorKind::Transient,
        SessionError::Provider(ProviderError::Rejected(_)) => ErrorKind::AuthRejected,
        SessionError::ActivationTimeout => ErrorKind::Transient,
    }
}

/// Classifies a [`PoolError`] into the domain-level error taxonomy.
///
/// `Factory`/`WarmupFailed` wrap whatever the connect factory returned as an
/// opaque `anyhow::Error`; a TOFU mismatch surfacing from the SSH dial deep
/// inside that factory must still classify as `HostKeyMismatch` rather than
/// the generic `Transient` every other dial failure gets, so it is searched
/// for in the error's source chain before falling back to `Transient`.
pub fn classify_pool_error(err: &PoolError) -> ErrorKind {
    match err {
        PoolError::Exhausted { .. } => ErrorKind::PoolExhausted,
        PoolError::Closed => ErrorKind::Cancelled,
        PoolError::WarmupFailed { .. } => ErrorKind::Transient,
        PoolError::Factory(source) => host_key_mismatch_in_chain(source).unwrap_or(ErrorKind::Transient),
    }
}

/// Finds a [`HostKeyError`] anywhere in `err`'s source chain and classifies
/// it, so a host-key mismatch raised several error-wrapping layers below a
/// `ConnectionPool` factory is still surfaced as `HostKeyMismatch`.
fn host_key_mismatch_in_chain(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HostKeyError>())
        .map(classify_host_key_error)
}

/// Classifies a [`HostKeyError`] into the domain-level error taxonomy.
pub fn classify_host_key_error(err: &HostKeyError) -> ErrorKind {
    match err {
        HostKeyError::Mismatch { .. } => ErrorKind::HostKeyMismatch,
        HostKeyError::Read { .. } | HostKeyError::Write { .. } | HostKeyError::Malformed { .. } => {
            ErrorKind::ConfigInvalid
        }
    }
}

/// Classifies a [`ForwardingError`] into the domain-level error taxonomy.
pub fn classify_forwarding_error(err: &ForwardingError) -> ErrorKind {
    match err {
        ForwardingError::Bind { .. } => ErrorKind::ConfigInvalid,
        ForwardingError::ListenerFailed { .. } => ErrorKind::ListenerFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_auth_expired_are_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::AuthExpired.is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        for kind in [
            ErrorKind::AuthRejected,
            ErrorKind::AuthzDenied,
            ErrorKind::NotFound,
            ErrorKind::ConfigInvalid,
            ErrorKind::PoolExhausted,
            ErrorKind::ListenerFailed,
            ErrorKind::HostKeyMismatch,
            ErrorKind::Cancelled,
        ] {
            assert!(!kind.is_retryable(), "{kind:?} should not be retryable");
        }
    }

    #[test]
    fn host_key_mismatch_classification() {
        let err = HostKeyError::Mismatch {
            host: "bastion:22".to_string(),
        };
        assert_eq!(classify_host_key_error(&err), ErrorKind::HostKeyMismatch);
    }

    #[test]
    fn pool_exhausted_classification() {
        let err = PoolError::Exhausted { size: 5 };
        assert_eq!(classify_pool_error(&err), ErrorKind::PoolExhausted);
    }

    #[test]
    fn pool_factory_error_classifies_host_key_mismatch_from_chain() {
        let host_key_err = HostKeyError::Mismatch {
            host: "bastion:22".to_string(),
        };
        let wrapped = anyhow::Error::new(host_key_err).context("dialing bastion:22");
        let err = PoolError::Factory(wrapped);
        assert_eq!(classify_pool_error(&err), ErrorKind::HostKeyMismatch);
    }

    #[test]
    fn pool_factory_error_without_host_key_falls_back_to_transient() {
        let err = PoolError::Factory(anyhow::anyhow!("connection refused"));
        assert_eq!(classify_pool_error(&err), ErrorKind::Transient);
    }

    #[test]
    fn forwarding_error_classification() {
        assert_eq!(
            classify_forwarding_error(&ForwardingError::ListenerFailed {
                consecutive_failures: 10,
                last_error: "connection reset".to_string(),
            }),
            ErrorKind::ListenerFailed
        );
        assert_eq!(
            classify_forwarding_error(&ForwardingError::Bind {
                addr: "127.0.0.1:6443".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
            }),
            ErrorKind::ConfigInvalid
        );
    }
}
