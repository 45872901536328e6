use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::credentials::PairSkip;
use crate::htpasswd::StoreChange;
use crate::patch::PatchOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Ok,
    Skipped,
    Degraded,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Skipped => "skipped",
            Self::Degraded => "degraded",
        })
    }
}

/// One human-readable status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthStatus {
    Disabled { skipped: Vec<PairSkip> },
    Enabled {
        username: String,
        store: PathBuf,
        change: StoreChange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TlsStatus {
    NotAttempted,
    Skipped,
    Issued { secured: bool },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PatchStatus {
    Applied(PatchOutcome),
    Unresolved { error: String },
}

/// Everything a run did, in order. Serializable for callers that need a
/// structured result instead of parsing status text.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub domain: String,
    pub auth: Option<AuthStatus>,
    pub tls: TlsStatus,
    pub patch: Option<PatchStatus>,
    pub statuses: Vec<Status>,
}

impl RunReport {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            auth: None,
            tls: TlsStatus::NotAttempted,
            patch: None,
            statuses: Vec::new(),
        }
    }

    pub fn ok(&mut self, message: impl Into<String>) {
        self.push(StatusKind::Ok, message.into());
    }

    pub fn skipped(&mut self, message: impl Into<String>) {
        self.push(StatusKind::Skipped, message.into());
    }

    pub fn degraded(&mut self, message: impl Into<String>) {
        self.push(StatusKind::Degraded, message.into());
    }

    fn push(&mut self, kind: StatusKind, message: String) {
        match kind {
            StatusKind::Degraded => warn!(domain = %self.domain, "{message}"),
            _ => info!(domain = %self.domain, "{message}"),
        }
        self.statuses.push(Status { kind, message });
    }

    /// Whether any step ended in a degraded state.
    pub fn is_degraded(&self) -> bool {
        self.statuses.iter().any(|s| s.kind == StatusKind::Degraded)
    }

    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.statuses.iter().map(ToString::to_string)
    }
}
