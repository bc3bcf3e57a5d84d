//! Task runner: one generic interval loop per (job, task kind), plus the
//! single-run path shared with calendar dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::operations::{Operations, TaskRequest};
use crate::reporting::Reporter;
use crate::repository::{LoadedRepository, RepositoryLoader};
use crate::types::{Job, TaskKind};

/// Collaborators a task needs to open repositories and run operations.
#[derive(Clone)]
pub struct Backend {
    pub loader: Arc<dyn RepositoryLoader>,
    pub operations: Arc<dyn Operations>,
}

impl Backend {
    pub fn new(loader: Arc<dyn RepositoryLoader>, operations: Arc<dyn Operations>) -> Self {
        Self { loader, operations }
    }
}

/// Run `kind` for `job` once: load, operate, purge, report, close.
///
/// Operational failures end up in the report and return `Ok`. Only a
/// configuration error (an unparseable sync direction) is returned.
pub async fn run_task(job: &Job, kind: TaskKind, backend: &Backend, reporter: &Reporter) -> Result<()> {
    let Some(request) = TaskRequest::for_job(job, kind)? else {
        warn!(job = %job.name, %kind, "job has no such task, skipping");
        return Ok(());
    };

    let repo = match backend.loader.load(&job.repository).await {
        Ok(repo) => repo,
        Err(e) => {
            error!(
                job = %job.name,
                %kind,
                repository = %job.repository,
                error = %e,
                "failed to load repository"
            );
            return Ok(());
        }
    };

    execute(job, kind, &request, &repo, backend, reporter).await;
    repo.close();
    Ok(())
}

async fn execute(
    job: &Job,
    kind: TaskKind,
    request: &TaskRequest,
    repo: &LoadedRepository,
    backend: &Backend,
    reporter: &Reporter,
) {
    let report = reporter
        .new_report()
        .task_start(kind, &job.name)
        .with_repository_name(&job.repository)
        .with_repository(repo.repository());
    debug!(job = %job.name, %kind, op = request.verb(), "running task");

    let outcome = match backend.operations.execute(repo.repository(), request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            report.task_failed(e.exit_code(), e.to_string());
            return;
        }
    };
    if !outcome.is_success() {
        let message = outcome
            .warning
            .unwrap_or_else(|| format!("{} exited with code {}", request.verb(), outcome.exit_code));
        report.task_failed(outcome.exit_code, message);
        return;
    }

    let report = match outcome.snapshot_id.as_deref() {
        Some(id) => report.with_snapshot_id(id),
        None => report,
    };
    let mut warnings: Vec<String> = outcome.warning.into_iter().collect();
    if let Some(problem) = purge(job, kind, repo, backend).await {
        warnings.push(problem);
    }

    if warnings.is_empty() {
        report.task_done();
    } else {
        report.task_warning(warnings.join("; "));
    }
}

/// Apply the job's retention window. Returns a warning on failure.
async fn purge(job: &Job, kind: TaskKind, repo: &LoadedRepository, backend: &Backend) -> Option<String> {
    let retention = job.retention(kind)?;
    let Some(before) = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
    else {
        debug!(job = %job.name, ?retention, "retention window reaches past the epoch, nothing to purge");
        return None;
    };

    let request = TaskRequest::purge(&job.name, before);
    match backend.operations.execute(repo.repository(), &request).await {
        Ok(outcome) if outcome.is_success() => {
            info!(job = %job.name, %kind, %before, "retention purge done");
            None
        }
        Ok(outcome) => Some(format!("retention purge exited with code {}", outcome.exit_code)),
        Err(e) => Some(format!("retention purge failed: {e}")),
    }
}

/// Re-run `kind` every `every` until `token` is cancelled.
///
/// The first run happens one interval after launch. A configuration error
/// cancels `token`, stopping the whole scheduler run.
pub async fn task_loop(
    job: Arc<Job>,
    kind: TaskKind,
    every: Duration,
    backend: Backend,
    reporter: Reporter,
    token: CancellationToken,
) {
    if let Err(e) = TaskRequest::for_job(&job, kind) {
        error!(job = %job.name, %kind, error = %e, "invalid task configuration, stopping scheduler");
        token.cancel();
        return;
    }
    info!(job = %job.name, %kind, every_secs = every.as_secs(), "task loop started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        if let Err(e) = run_task(&job, kind, &backend, &reporter).await {
            error!(job = %job.name, %kind, error = %e, "invalid task configuration, stopping scheduler");
            token.cancel();
            break;
        }
    }
    debug!(job = %job.name, %kind, "task loop stopped");
}
