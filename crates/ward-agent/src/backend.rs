//! Repository loader and operations backed by an external backup program.
//!
//! Every operation runs `<program> [args…] at <location> <verb> …` with the
//! repository passphrase handed over in the configured environment variable.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio::process::Command;
use tracing::{debug, warn};
use ward_core::config::{AgentConfig, RepositoryConfig};
use ward_scheduler::{
    LoadedRepository, OperationError, Operations, Outcome, Repository, RepositoryLoader,
    SchedulerError, Store, TaskRequest,
};

/// Loader + operations reading the agent configuration afresh on every use.
pub struct CommandBackend {
    config_path: Option<String>,
}

impl CommandBackend {
    pub fn new(config_path: Option<String>) -> Self {
        Self { config_path }
    }

    fn config(&self) -> ward_core::Result<AgentConfig> {
        AgentConfig::load(self.config_path.as_deref())
    }
}

struct CommandRepository {
    name: String,
    location: String,
}

impl Repository for CommandRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> String {
        self.location.clone()
    }

    fn close(&mut self) {
        debug!(repository = %self.name, "repository closed");
    }
}

struct CommandStore {
    location: String,
}

impl Store for CommandStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn close(&mut self) {}
}

fn is_local(location: &str) -> bool {
    !location.contains("://")
}

#[async_trait]
impl RepositoryLoader for CommandBackend {
    async fn load(&self, name: &str) -> ward_scheduler::Result<LoadedRepository> {
        let config = self
            .config()
            .map_err(|e| SchedulerError::Repository(format!("failed to reload agent configuration: {e}")))?;
        let repo = config
            .repository(name)
            .map_err(|e| SchedulerError::Repository(e.to_string()))?;

        if is_local(&repo.location) && tokio::fs::metadata(&repo.location).await.is_err() {
            return Err(SchedulerError::Repository(format!(
                "repository {name}: location {} does not exist",
                repo.location
            )));
        }

        Ok(LoadedRepository::new(
            Box::new(CommandRepository {
                name: name.to_string(),
                location: repo.location.clone(),
            }),
            Box::new(CommandStore {
                location: repo.location.clone(),
            }),
        ))
    }
}

/// Verb-specific arguments following `at <location>`.
pub fn arguments(request: &TaskRequest) -> Vec<String> {
    let mut args = vec![request.verb().to_string()];
    match request {
        TaskRequest::Backup { job, path, check } => {
            args.extend(["-job".to_string(), job.clone()]);
            if *check {
                args.push("-check".into());
            }
            args.push(path.clone());
        }
        TaskRequest::Check { path, latest, .. } => {
            if *latest {
                args.push("-latest".into());
            }
            args.extend(path.clone());
        }
        TaskRequest::Restore { path, target, .. } => {
            args.extend(["-to".to_string(), target.clone()]);
            args.extend(path.clone());
        }
        TaskRequest::Sync { peer, direction, .. } => {
            args.extend([direction.as_str().to_string(), peer.clone()]);
        }
        TaskRequest::Maintenance { .. } => {}
        TaskRequest::Purge { job, before } => {
            args.extend([
                "-job".to_string(),
                job.clone(),
                "-before".to_string(),
                before.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]);
        }
    }
    args
}

async fn run_program(
    config: &AgentConfig,
    repo: &RepositoryConfig,
    request: &TaskRequest,
) -> Result<Outcome, OperationError> {
    let backend = &config.backend;
    let mut command = Command::new(&backend.program);
    command
        .args(&backend.args)
        .arg("at")
        .arg(&repo.location)
        .args(arguments(request))
        .stdin(Stdio::null());
    if let Some(passphrase) = &repo.passphrase {
        command.env(&backend.passphrase_env, passphrase);
    }
    debug!(program = %backend.program, op = request.verb(), location = %repo.location, "running backup program");

    let output = command.output().await.map_err(|source| OperationError::Launch {
        verb: request.verb(),
        source,
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();

    // killed by a signal: no code
    let exit_code = output.status.code().unwrap_or(1);
    if exit_code != 0 {
        let message = if stderr.is_empty() {
            format!("{} exited with code {exit_code}", request.verb())
        } else {
            stderr.to_string()
        };
        return Err(OperationError::failed(exit_code, message));
    }

    let mut outcome = Outcome::success();
    if matches!(request, TaskRequest::Backup { .. }) {
        if let Some(id) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
            outcome = outcome.with_snapshot_id(id);
        }
    }
    if !stderr.is_empty() {
        outcome = outcome.with_warning(stderr);
    }
    Ok(outcome)
}

#[async_trait]
impl Operations for CommandBackend {
    async fn execute(
        &self,
        repository: &dyn Repository,
        request: &TaskRequest,
    ) -> Result<Outcome, OperationError> {
        let config = self
            .config()
            .map_err(|e| OperationError::failed(1, format!("failed to reload agent configuration: {e}")))?;
        let repo = config
            .repository(repository.name())
            .map_err(|e| OperationError::failed(1, e.to_string()))?;
        let outcome = run_program(&config, repo, request).await?;
        if let Some(warning) = &outcome.warning {
            warn!(repository = repository.name(), op = request.verb(), %warning, "backup program wrote to stderr");
        }
        Ok(outcome)
    }
}
