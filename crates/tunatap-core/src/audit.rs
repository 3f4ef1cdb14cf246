//! `AuditSink` (C11) — append-only JSON-lines audit log, one file per UTC
//! date, plus an in-memory session-tracking table so `endSession` can
//! compute a duration without the caller having to remember the start
//! time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connect,
    Disconnect,
    Error,
    SessionRefresh,
    Exec,
}

/// One audit log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: EventType,
    pub session_id: String,
    pub cluster_name: String,
    pub region: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub bastion_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn connect(session_id: &str, cluster_name: &str, region: &str) -> Self {
        Self {
            timestamp: None,
            event_type: EventType::Connect,
            session_id: session_id.to_string(),
            cluster_name: cluster_name.to_string(),
            region: region.to_string(),
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            bastion_id: String::new(),
            duration_ns: None,
            error: None,
            command: None,
            exit_code: None,
            user: None,
            metadata: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to create audit directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open audit file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write audit event: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone)]
struct OpenSessionRecord {
    cluster_name: String,
    region: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    bastion_id: String,
    started_at: DateTime<Utc>,
}

/// Criteria for [`AuditSink::query`].
#[derive(Debug, Default, Clone)]
pub struct QueryCriteria {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cluster_name: Option<String>,
    pub event_type: Option<EventType>,
    pub session_id: Option<String>,
    pub tail_n: Option<usize>,
}

/// Append-only JSON-lines audit log rooted at `audit_dir`, plus a
/// session-tracking table mapping session-id to its open record.
pub struct AuditSink {
    audit_dir: PathBuf,
    file: Mutex<()>,
    sessions: RwLock<HashMap<String, OpenSessionRecord>>,
}

impl AuditSink {
    pub fn new(audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            audit_dir: audit_dir.into(),
            file: Mutex::new(()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn file_path_for(&self, when: DateTime<Utc>) -> PathBuf {
        self.audit_dir
            .join(format!("audit-{}.jsonl", when.format("%Y-%m-%d")))
    }

    /// Marshals `event` to one JSON object + newline, writes, and fsyncs.
    /// Sets `timestamp=now` if unset.
    pub fn log(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let now = Utc::now();
        if event.timestamp.is_none() {
            event.timestamp = Some(now);
        }
        let when = event.timestamp.unwrap_or(now);

        std::fs::create_dir_all(&self.audit_dir).map_err(|source| AuditError::CreateDir {
            path: self.audit_dir.display().to_string(),
            source,
        })?;

        let path = self.file_path_for(when);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.file.lock().expect("audit file mutex poisoned");
        let mut file = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .mode(0o600)
                    .open(&path)
            }
            #[cfg(not(unix))]
            {
                OpenOptions::new().create(true).append(true).open(&path)
            }
        }
        .map_err(|source| AuditError::Open {
            path: path.display().to_string(),
            source,
        })?;

        file.write_all(line.as_bytes()).map_err(AuditError::Write)?;
        file.sync_all().map_err(AuditError::Write)
    }

    /// Assigns an id if `session_id` is empty, records the open session,
    /// and emits a `Connect` event.
    pub fn start_session(
        &self,
        session_id: &str,
        cluster_name: &str,
        region: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        bastion_id: &str,
    ) -> Result<String, AuditError> {
        let session_id = if session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            session_id.to_string()
        };

        let started_at = Utc::now();
        self.sessions.write().insert(
            session_id.clone(),
            OpenSessionRecord {
                cluster_name: cluster_name.to_string(),
                region: region.to_string(),
                local_port,
                remote_host: remote_host.to_string(),
                remote_port,
                bastion_id: bastion_id.to_string(),
                started_at,
            },
        );

        self.log(AuditEvent {
            timestamp: Some(started_at),
            event_type: EventType::Connect,
            session_id: session_id.clone(),
            cluster_name: cluster_name.to_string(),
            region: region.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            bastion_id: bastion_id.to_string(),
            duration_ns: None,
            error: None,
            command: None,
            exit_code: None,
            user: None,
            metadata: None,
        })?;

        Ok(session_id)
    }

    /// Computes duration from the tracked start time, emits `Disconnect`
    /// (or `Error` if `err` is set), and removes the session from
    /// tracking.
    pub fn end_session(&self, session_id: &str, err: Option<&str>) -> Result<(), AuditError> {
        let record = self.sessions.write().remove(session_id);
        let now = Utc::now();
        let (cluster_name, region, local_port, remote_host, remote_port, bastion_id, duration_ns) =
            match &record {
                Some(r) => {
                    let duration_ns = (now - r.started_at)
                        .to_std()
                        .map(|d| d.as_nanos() as u64)
                        .unwrap_or(0);
                    (
                        r.cluster_name.clone(),
                        r.region.clone(),
                        r.local_port,
                        r.remote_host.clone(),
                        r.remote_port,
                        r.bastion_id.clone(),
                        Some(duration_ns),
                    )
                }
                None => (String::new(), String::new(), 0, String::new(), 0, String::new(), None),
            };

        let event_type = if err.is_some_and(|e| !e.is_empty()) {
            EventType::Error
        } else {
            EventType::Disconnect
        };

        self.log(AuditEvent {
            timestamp: Some(now),
            event_type,
            session_id: session_id.to_string(),
            cluster_name,
            region,
            local_port,
            remote_host,
            remote_port,
            bastion_id,
            duration_ns,
            error: err.filter(|e| !e.is_empty()).map(|e| e.to_string()),
            command: None,
            exit_code: None,
            user: None,
            metadata: None,
        })
    }

    /// Scans files covering `[from, to]` (defaulting to all files present)
    /// and filters in-memory by the remaining criteria.
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<AuditEvent>, AuditError> {
        let mut matched = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.audit_dir) else {
            return Ok(matched);
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("jsonl")
                    && p.file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.starts_with("audit-"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let contents = std::fs::read_to_string(&path).map_err(|source| AuditError::Open {
                path: path.display().to_string(),
                source,
            })?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: AuditEvent = serde_json::from_str(line)?;
                if self.matches(&event, criteria) {
                    matched.push(event);
                }
            }
        }

        if let Some(tail_n) = criteria.tail_n {
            let start = matched.len().saturating_sub(tail_n);
            matched = matched.split_off(start);
        }

        Ok(matched)
    }

    fn matches(&self, event: &AuditEvent, criteria: &QueryCriteria) -> bool {
        if let Some(ts) = event.timestamp {
            if let Some(from) = criteria.from {
                if ts < from {
                    return false;
                }
            }
            if let Some(to) = criteria.to {
                if ts > to {
                    return false;
                }
            }
        }
        if let Some(cluster) = &criteria.cluster_name {
            if &event.cluster_name != cluster {
                return false;
            }
        }
        if let Some(event_type) = criteria.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(session_id) = &criteria.session_id {
            if &event.session_id != session_id {
                return false;
            }
        }
        true
    }
}
