//! `SessionManager` (C5) — owns at most one active bastion session per
//! cluster-endpoint pair; matches/reuses existing provider sessions and
//! refreshes before expiry.

use crate::auth::{AuthError, AuthProvider, ResolvedCredential};
use crate::endpoint::Endpoint;
use crate::provider::{
    BastionSessionDescriptor, BastionSessionProvider, CreateSessionRequest, LifecycleState,
    ProviderError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Remaining time above which an existing session is adopted rather than
/// recreated (spec step 1 of `acquire`).
const CHECK_BUFFER: Duration = Duration::from_secs(10 * 60);
/// Remaining time below which the current session is considered due for
/// refresh.
const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
/// Default requested session lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);
/// Overall deadline while polling a freshly created session for `Active`.
const ACTIVATION_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Interval between `LifecycleState` polls while waiting for activation.
const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("auth provider could not resolve a signer: {0}")]
    Auth(#[from] AuthError),
    #[error("bastion session provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("session did not reach Active state within the activation deadline")]
    ActivationTimeout,
}

/// A `(signer, public-key-string)` pair the `SessionManager` has registered
/// with the provider, stable across calls until the session is replaced.
#[derive(Clone)]
pub struct SignerBlob {
    pub credential: Arc<ResolvedCredential>,
    pub public_key_content: String,
}

struct CurrentSession {
    descriptor: BastionSessionDescriptor,
    signer: SignerBlob,
}

/// Owns the single active [`BastionSessionDescriptor`] for one
/// cluster-endpoint pair, coalescing concurrent `acquire` calls behind a
/// mutex so only one creation is ever in flight.
pub struct SessionManager<P: BastionSessionProvider> {
    provider: Arc<P>,
    auth: Arc<AuthProvider>,
    bastion_id: String,
    target: Endpoint,
    current: RwLock<Option<CurrentSession>>,
    refresh_tx: watch::Sender<Option<String>>,
}

impl<P: BastionSessionProvider> SessionManager<P> {
    pub fn new(provider: Arc<P>, auth: Arc<AuthProvider>, bastion_id: String, target: Endpoint) -> Self {
        let (refresh_tx, _) = watch::channel(None);
        Self {
            provider,
            auth,
            bastion_id,
            target,
            current: RwLock::new(None),
            refresh_tx,
        }
    }

    fn public_key_blob(&self) -> Result<(Arc<ResolvedCredential>, String), SessionError> {
        let credential = Arc::new(self.auth.resolve()?);
        let blob = self.auth.public_key_blob(&credential)?;
        Ok((credential, blob))
    }

    /// Returns a session ready for SSH authentication against the bastion,
    /// adopting a matching existing session or creating a new one.
    pub async fn acquire(&self) -> Result<BastionSessionDescriptor, SessionError> {
        {
            let guard = self.current.read().await;
            if let Some(current) = guard.as_ref() {
                if current.descriptor.state == LifecycleState::Active
                    && current.descriptor.remaining(chrono::Utc::now()) > CHECK_BUFFER
                {
                    return Ok(current.descriptor.clone());
                }
            }
        }

        let mut guard = self.current.write().await;
        // Re-check under the write lock: a concurrent acquire may have
        // already completed the creation while we waited for the lock.
        if let Some(current) = guard.as_ref() {
            if current.descriptor.state == LifecycleState::Active
                && current.descriptor.remaining(chrono::Utc::now()) > CHECK_BUFFER
            {
                return Ok(current.descriptor.clone());
            }
        }

        if let Some(adopted) = self.adopt_existing().await? {
            let signer = self.current_or_new_signer(&guard)?;
            let descriptor = adopted.clone();
            *guard = Some(CurrentSession {
                descriptor: adopted,
                signer,
            });
            return Ok(descriptor);
        }

        let descriptor = self.create_and_activate().await?;
        let signer = self.current_or_new_signer(&guard)?;
        let result = descriptor.clone();
        *guard = Some(CurrentSession { descriptor, signer });
        let _ = self.refresh_tx.send(Some(result.id.clone()));
        Ok(result)
    }

    fn current_or_new_signer(
        &self,
        guard: &Option<CurrentSession>,
    ) -> Result<SignerBlob, SessionError> {
        if let Some(current) = guard {
            return Ok(current.signer.clone());
        }
        let (credential, public_key_content) = self.public_key_blob()?;
        Ok(SignerBlob {
            credential,
            public_key_content,
        })
    }

    async fn adopt_existing(&self) -> Result<Option<BastionSessionDescriptor>, SessionError> {
        let sessions = self.provider.list_sessions(&self.bastion_id).await?;
        let now = chrono::Utc::now();
        Ok(sessions.into_iter().find(|s| {
            s.state == LifecycleState::Active
                && s.target == self.target
                && s.remaining(now) > CHECK_BUFFER
        }))
    }

    async fn create_and_activate(&self) -> Result<BastionSessionDescriptor, SessionError> {
        let (_, public_key_content) = self.public_key_blob()?;
        let created = self
            .provider
            .create_session(CreateSessionRequest {
                bastion_id: self.bastion_id.clone(),
                target: self.target.clone(),
                public_key_content,
                ttl: DEFAULT_TTL,
            })
            .await?;

        if created.state == LifecycleState::Active {
            return Ok(created);
        }

        let deadline = tokio::time::Instant::now() + ACTIVATION_DEADLINE;
        loop {
            tokio::time::sleep(ACTIVATION_POLL_INTERVAL).await;
            let polled = self
                .provider
                .get_session(&self.bastion_id, &created.id)
                .await?;
            if polled.state == LifecycleState::Active {
                return Ok(polled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::ActivationTimeout);
            }
        }
    }

    /// True iff no session exists yet, or the current one is within
    /// `REFRESH_BUFFER` of expiry.
    pub async fn needs_refresh(&self) -> bool {
        let guard = self.current.read().await;
        match guard.as_ref() {
            None => true,
            Some(current) => current.descriptor.remaining(chrono::Utc::now()) <= REFRESH_BUFFER,
        }
    }

    /// Stable reference to the signer currently registered with the
    /// provider.
    pub async fn current_signer_blob(&self) -> Option<SignerBlob> {
        self.current.read().await.as_ref().map(|c| c.signer.clone())
    }

    /// Subscribe to new-session-id notifications emitted by `acquire` and
    /// `auto_refresh`.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.refresh_tx.subscribe()
    }

    /// Long-running task: every `refresh_interval`, checks
    /// [`needs_refresh`](Self::needs_refresh) and, if due, creates a new
    /// session and atomically swaps it into place. The old session remains
    /// valid for its full TTL; nothing tears down in-flight SSH clients.
    pub async fn auto_refresh(&self, refresh_interval: Duration, cancel: &tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(refresh_interval) => {}
            }

            if !self.needs_refresh().await {
                continue;
            }

            match self.create_and_activate().await {
                Ok(descriptor) => {
                    let mut guard = self.current.write().await;
                    let signer = self.current_or_new_signer(&guard).unwrap_or_else(|_| {
                        guard.as_ref().expect("signer known before refresh").signer.clone()
                    });
                    let id = descriptor.id.clone();
                    *guard = Some(CurrentSession { descriptor, signer });
                    drop(guard);
                    info!(new_session_id = %id, "bastion session auto-refreshed");
                    let _ = self.refresh_tx.send(Some(id));
                }
                Err(err) => {
                    warn!(error = %err, "bastion session auto-refresh failed, retaining current session");
                }
            }
        }
    }
}
