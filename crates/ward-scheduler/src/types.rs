use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::schedule::Schedule;

/// Full scheduler configuration: every job keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
}

impl Configuration {
    /// Read a TOML configuration document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SchedulerError::InvalidConfiguration(format!(
                "{} is not a readable file",
                path.display()
            )));
        }
        let config: Configuration = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| SchedulerError::InvalidConfiguration(e.to_string()))?;
        Ok(config.normalized())
    }

    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Configuration = Figment::new()
            .merge(Toml::string(document))
            .extract()
            .map_err(|e| SchedulerError::InvalidConfiguration(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Decode the wire form carried by a `configure` request.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Configuration = serde_json::from_slice(bytes)
            .map_err(|e| SchedulerError::InvalidConfiguration(e.to_string()))?;
        Ok(config.normalized())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SchedulerError::InvalidConfiguration(e.to_string()))
    }

    /// Jobs carry their map key as name.
    fn normalized(mut self) -> Self {
        for (name, job) in self.jobs.iter_mut() {
            job.name = name.clone();
        }
        self
    }
}

/// A named unit of work against one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Filled from the configuration key.
    #[serde(default, skip_serializing)]
    pub name: String,
    /// Repository name, resolved through the agent configuration.
    pub repository: String,
    /// Calendar triggers for the backup task.
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    pub backup: Option<BackupTask>,
    pub check: Option<CheckTask>,
    pub restore: Option<RestoreTask>,
    pub sync: Option<SyncTask>,
    pub maintenance: Option<MaintenanceTask>,
}

impl Job {
    /// Fixed re-run interval for `kind`, if that task is configured with one.
    pub fn interval(&self, kind: TaskKind) -> Option<Duration> {
        let secs = match kind {
            TaskKind::Backup => self.backup.as_ref()?.interval_secs,
            TaskKind::Check => self.check.as_ref()?.interval_secs,
            TaskKind::Restore => self.restore.as_ref()?.interval_secs,
            TaskKind::Sync => self.sync.as_ref()?.interval_secs,
            TaskKind::Maintenance => self.maintenance.as_ref()?.interval_secs,
        }?;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Retention window for `kind`; `None` disables the purge.
    pub fn retention(&self, kind: TaskKind) -> Option<Duration> {
        let secs = match kind {
            TaskKind::Backup => self.backup.as_ref()?.retention_secs,
            TaskKind::Maintenance => self.maintenance.as_ref()?.retention_secs,
            _ => None,
        }?;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Task kinds configured on this job.
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                TaskKind::Backup => self.backup.is_some(),
                TaskKind::Check => self.check.is_some(),
                TaskKind::Restore => self.restore.is_some(),
                TaskKind::Sync => self.sync.is_some(),
                TaskKind::Maintenance => self.maintenance.is_some(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTask {
    /// Source path to back up.
    pub path: String,
    /// Verify the snapshot right after creating it.
    #[serde(default)]
    pub check: bool,
    pub interval_secs: Option<u64>,
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTask {
    /// Restrict verification to this sub-path.
    pub path: Option<String>,
    /// Only verify the most recent snapshot.
    #[serde(default)]
    pub latest: bool,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTask {
    pub path: Option<String>,
    pub target: String,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Peer repository location.
    pub peer: String,
    /// `to`, `from` or `with`; validated when the task loop starts.
    pub direction: String,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub interval_secs: Option<u64>,
    pub retention_secs: Option<u64>,
}

/// Operation category a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Check,
    Restore,
    Sync,
    Maintenance,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Backup,
        TaskKind::Check,
        TaskKind::Restore,
        TaskKind::Sync,
        TaskKind::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Backup => "backup",
            TaskKind::Check => "check",
            TaskKind::Restore => "restore",
            TaskKind::Sync => "sync",
            TaskKind::Maintenance => "maintenance",
        }
    }

    /// Whether a successful run is followed by a retention purge.
    pub fn supports_retention(&self) -> bool {
        matches!(self, TaskKind::Backup | TaskKind::Maintenance)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Which way a sync moves snapshots relative to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Push local snapshots to the peer.
    To,
    /// Pull the peer's snapshots.
    From,
    /// Both ways.
    With,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::To => "to",
            SyncDirection::From => "from",
            SyncDirection::With => "with",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "to" => Ok(SyncDirection::To),
            "from" => Ok(SyncDirection::From),
            "with" => Ok(SyncDirection::With),
            other => Err(SchedulerError::InvalidSyncDirection(other.to_string())),
        }
    }
}
