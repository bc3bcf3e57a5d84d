//! Backup operations a task asks a repository to perform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::Result;
use crate::repository::Repository;
use crate::types::{Job, SyncDirection, TaskKind};

/// Kind-specific parameters for one operation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    Backup {
        job: String,
        path: String,
        check: bool,
    },
    Check {
        job: String,
        path: Option<String>,
        latest: bool,
    },
    Restore {
        job: String,
        path: Option<String>,
        target: String,
    },
    Sync {
        job: String,
        peer: String,
        direction: SyncDirection,
    },
    Maintenance {
        job: String,
    },
    /// Remove the job's snapshots created strictly before `before`.
    Purge {
        job: String,
        before: DateTime<Utc>,
    },
}

impl TaskRequest {
    /// Build the request for `kind` from the job's task config.
    ///
    /// Returns `Ok(None)` when the job has no such task, and an error when
    /// the sync direction does not parse.
    pub fn for_job(job: &Job, kind: TaskKind) -> Result<Option<Self>> {
        let job_name = job.name.clone();
        let request = match kind {
            TaskKind::Backup => job.backup.as_ref().map(|t| TaskRequest::Backup {
                job: job_name,
                path: t.path.clone(),
                check: t.check,
            }),
            TaskKind::Check => job.check.as_ref().map(|t| TaskRequest::Check {
                job: job_name,
                path: t.path.clone(),
                latest: t.latest,
            }),
            TaskKind::Restore => job.restore.as_ref().map(|t| TaskRequest::Restore {
                job: job_name,
                path: t.path.clone(),
                target: t.target.clone(),
            }),
            TaskKind::Sync => match job.sync.as_ref() {
                Some(t) => Some(TaskRequest::Sync {
                    job: job_name,
                    peer: t.peer.clone(),
                    direction: t.direction.parse()?,
                }),
                None => None,
            },
            TaskKind::Maintenance => job
                .maintenance
                .as_ref()
                .map(|_| TaskRequest::Maintenance { job: job_name }),
        };
        Ok(request)
    }

    pub fn purge(job: &str, before: DateTime<Utc>) -> Self {
        TaskRequest::Purge {
            job: job.to_string(),
            before,
        }
    }

    /// Short verb used in logs and on the backend command line.
    pub fn verb(&self) -> &'static str {
        match self {
            TaskRequest::Backup { .. } => "backup",
            TaskRequest::Check { .. } => "check",
            TaskRequest::Restore { .. } => "restore",
            TaskRequest::Sync { .. } => "sync",
            TaskRequest::Maintenance { .. } => "maintenance",
            TaskRequest::Purge { .. } => "rm",
        }
    }

    pub fn job(&self) -> &str {
        match self {
            TaskRequest::Backup { job, .. }
            | TaskRequest::Check { job, .. }
            | TaskRequest::Restore { job, .. }
            | TaskRequest::Sync { job, .. }
            | TaskRequest::Maintenance { job }
            | TaskRequest::Purge { job, .. } => job,
        }
    }
}

/// Result of an operation that ran to completion.
///
/// A non-zero `exit_code` is still an `Outcome`: the operation ran but
/// reported failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: i32,
    pub snapshot_id: Option<String>,
    pub warning: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn with_snapshot_id(mut self, id: impl Into<String>) -> Self {
        self.snapshot_id = Some(id.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An operation that could not run at all, or failed with a message.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("failed to launch {verb}: {source}")]
    Launch {
        verb: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Failed { exit_code: i32, message: String },
}

impl OperationError {
    pub fn failed(exit_code: i32, message: impl Into<String>) -> Self {
        OperationError::Failed {
            exit_code,
            message: message.into(),
        }
    }

    /// Exit code to report; never 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            OperationError::Failed { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

/// Executes backup operations against an opened repository.
#[async_trait]
pub trait Operations: Send + Sync {
    async fn execute(
        &self,
        repository: &dyn Repository,
        request: &TaskRequest,
    ) -> std::result::Result<Outcome, OperationError>;
}
