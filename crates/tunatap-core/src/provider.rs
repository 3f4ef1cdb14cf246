//! `BastionSessionProvider` — the boundary to the cloud bastion service: an
//! opaque capability that creates sessions, lists them, and resolves
//! compartments. This crate never implements that API client; it only
//! depends on this trait, so any provider backend can be plugged in.

use crate::endpoint::Endpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Lifecycle state of a provider-issued bastion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Creating,
    Active,
    Expired,
    Deleted,
}

/// A provider-issued, time-bounded authorization to open SSH channels from
/// a bastion to a fixed `(private-ip, port)`.
#[derive(Debug, Clone)]
pub struct BastionSessionDescriptor {
    pub id: String,
    pub bastion_id: String,
    pub target: Endpoint,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub state: LifecycleState,
}

impl BastionSessionDescriptor {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.expires_at() - now;
        remaining.to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("bastion {bastion_id} not found")]
    BastionNotFound { bastion_id: String },
    #[error("session {session_id} not found on bastion {bastion_id}")]
    SessionNotFound {
        bastion_id: String,
        session_id: String,
    },
    #[error("provider request timed out")]
    Timeout,
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("transport error communicating with provider: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Request to mint a new bastion session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub bastion_id: String,
    pub target: Endpoint,
    pub public_key_content: String,
    pub ttl: Duration,
}

/// The cloud-provider API surface this crate depends on but does not
/// implement. An opaque capability per the component design: creates
/// sessions, lists them, resolves compartments.
#[async_trait]
pub trait BastionSessionProvider: Send + Sync {
    /// All sessions currently known for `bastion_id`, in any lifecycle
    /// state. `SessionManager::acquire` filters this list itself.
    async fn list_sessions(
        &self,
        bastion_id: &str,
    ) -> Result<Vec<BastionSessionDescriptor>, ProviderError>;

    /// Request creation of a new session. The returned descriptor may still
    /// be in `Creating` state; callers poll [`get_session`](Self::get_session)
    /// until it becomes `Active`.
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<BastionSessionDescriptor, ProviderError>;

    /// Current state of a single session, by id.
    async fn get_session(
        &self,
        bastion_id: &str,
        session_id: &str,
    ) -> Result<BastionSessionDescriptor, ProviderError>;
}

/// A `BastionSessionProvider` for bastions reachable directly, with no
/// provisioning API in front of them: it mints a session descriptor locally
/// (the supervisor then dials `bastion_id` as a plain hostname) rather than
/// calling out to a cloud control plane. The real OCI-style provider client
/// is a separate integration this crate does not implement; callers wire a
/// `BastionSessionProvider` of their own when one is available, and fall
/// back to this one for self-hosted or already-provisioned bastions.
pub struct LocalSessionProvider {
    ttl: Duration,
}

impl LocalSessionProvider {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl BastionSessionProvider for LocalSessionProvider {
    async fn list_sessions(&self, _bastion_id: &str) -> Result<Vec<BastionSessionDescriptor>, ProviderError> {
        Ok(Vec::new())
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<BastionSessionDescriptor, ProviderError> {
        Ok(BastionSessionDescriptor {
            id: request.bastion_id.clone(),
            bastion_id: request.bastion_id,
            target: request.target,
            created_at: Utc::now(),
            ttl: self.ttl,
            state: LifecycleState::Active,
        })
    }

    async fn get_session(&self, bastion_id: &str, session_id: &str) -> Result<BastionSessionDescriptor, ProviderError> {
        Err(ProviderError::SessionNotFound {
            bastion_id: bastion_id.to_string(),
            session_id: session_id.to_string(),
        })
    }
}

#[cfg(test)]
pub mod fakes {
    //! An in-memory, fully in-process fake of [`BastionSessionProvider`] for
    //! tests exercising `SessionManager` without a real cloud dependency.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub struct FakeBastionSessionProvider {
        sessions: Mutex<HashMap<String, BastionSessionDescriptor>>,
        next_id: Mutex<u64>,
        pub default_ttl: Duration,
        pub immediately_active: bool,
    }

    impl FakeBastionSessionProvider {
        pub fn new() -> Self {
            Self {
                sessions: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
                default_ttl: Duration::from_secs(3 * 3600),
                immediately_active: true,
            }
        }

        pub fn seed_active(&self, bastion_id: &str, target: Endpoint) -> String {
            let id = self.mint_id();
            let descriptor = BastionSessionDescriptor {
                id: id.clone(),
                bastion_id: bastion_id.to_string(),
                target,
                created_at: Utc::now(),
                ttl: self.default_ttl,
                state: LifecycleState::Active,
            };
            self.sessions.lock().insert(id.clone(), descriptor);
            id
        }

        fn mint_id(&self) -> String {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("fake-session-{next}")
        }

        /// Transition a session to `Active`, simulating provider-side
        /// provisioning completing after a poll.
        pub fn mark_active(&self, session_id: &str) {
            if let Some(session) = self.sessions.lock().get_mut(session_id) {
                session.state = LifecycleState::Active;
            }
        }
    }

    impl Default for FakeBastionSessionProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BastionSessionProvider for FakeBastionSessionProvider {
        async fn list_sessions(
            &self,
            bastion_id: &str,
        ) -> Result<Vec<BastionSessionDescriptor>, ProviderError> {
            Ok(self
                .sessions
                .lock()
                .values()
                .filter(|s| s.bastion_id == bastion_id)
                .cloned()
                .collect())
        }

        async fn create_session(
            &self,
            request: CreateSessionRequest,
        ) -> Result<BastionSessionDescriptor, ProviderError> {
            let id = self.mint_id();
            let descriptor = BastionSessionDescriptor {
                id: id.clone(),
                bastion_id: request.bastion_id,
                target: request.target,
                created_at: Utc::now(),
                ttl: request.ttl,
                state: if self.immediately_active {
                    LifecycleState::Active
                } else {
                    LifecycleState::Creating
                },
            };
            self.sessions.lock().insert(id, descriptor.clone());
            Ok(descriptor)
        }

        async fn get_session(
            &self,
            bastion_id: &str,
            session_id: &str,
        ) -> Result<BastionSessionDescriptor, ProviderError> {
            self.sessions
                .lock()
                .get(session_id)
                .filter(|s| s.bastion_id == bastion_id)
                .cloned()
                .ok_or_else(|| ProviderError::SessionNotFound {
                    bastion_id: bastion_id.to_string(),
                    session_id: session_id.to_string(),
                })
        }
    }
}
