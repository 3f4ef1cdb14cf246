//! tunatap-core — the tunnel-plane subsystem: bastion-session lifecycle,
//! the multiplexed SSH connection pool, the forwarding engine, and the
//! supervisor that composes them with retry, cancellation, health, and
//! audit hooks.
//!
//! Module map:
//!
//! - [`endpoint`] — the `(host, port)` value type.
//! - [`backoff`] — jittered exponential backoff.
//! - [`hostkeys`] — trust-on-first-use known-hosts store.
//! - [`auth`] — SSH signer resolution (agent, key file, ephemeral).
//! - [`provider`] — the `BastionSessionProvider` boundary the real cloud
//!   client implements; this crate only depends on the trait.
//! - [`session`] — `SessionManager`.
//! - [`pool`] — `TrackedConnection` and `ConnectionPool`.
//! - [`ssh`] — the `russh`-backed `SshClient` implementing [`pool::PoolClient`]
//!   and [`forwarding::DialChannel`].
//! - [`forwarding`] — `ForwardingEngine`.
//! - [`process`] — the INTERNAL bastion type's child-process `ssh -J` path.
//! - [`health`] — `HealthRegistry`.
//! - [`audit`] — `AuditSink`.
//! - [`realm`] — OCID realm/region/domain parsing.
//! - [`supervisor`] — composes everything above into one tunnel's run loop.
//! - [`config`] — the on-disk YAML configuration shape.
//! - [`error`] — the domain-level error taxonomy.

pub mod audit;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod forwarding;
pub mod health;
pub mod hostkeys;
pub mod pool;
pub mod process;
pub mod provider;
pub mod realm;
pub mod session;
pub mod ssh;
pub mod supervisor;

pub use endpoint::Endpoint;
pub use error::{ErrorKind, TunnelError};
pub use health::HealthRegistry;
