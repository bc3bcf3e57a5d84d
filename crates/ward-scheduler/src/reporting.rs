//! Task reports and the background worker that records them.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::Repository;
use crate::types::TaskKind;

/// Final state of one task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    Done,
    Warning { message: String },
    Failed { exit_code: i32, message: String },
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Done => "done",
            ReportStatus::Warning { .. } => "warning",
            ReportStatus::Failed { .. } => "failed",
        }
    }
}

/// One finished task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: Uuid,
    pub kind: TaskKind,
    pub job: String,
    pub repository_name: Option<String>,
    pub repository_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ReportStatus,
}

/// Destination for finished reports.
pub trait ReportSink: Send + Sync {
    fn record(&self, report: &TaskReport);
}

/// Writes one log line per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn record(&self, report: &TaskReport) {
        let repository = report.repository_name.as_deref().unwrap_or("-");
        match &report.status {
            ReportStatus::Done => info!(
                job = %report.job,
                kind = %report.kind,
                repository,
                snapshot = report.snapshot_id.as_deref().unwrap_or("-"),
                "task done"
            ),
            ReportStatus::Warning { message } => warn!(
                job = %report.job,
                kind = %report.kind,
                repository,
                %message,
                "task finished with warning"
            ),
            ReportStatus::Failed { exit_code, message } => error!(
                job = %report.job,
                kind = %report.kind,
                repository,
                exit_code,
                %message,
                "task failed"
            ),
        }
    }
}

/// Hands every report to each inner sink in order.
pub struct MultiSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

impl ReportSink for MultiSink {
    fn record(&self, report: &TaskReport) {
        for sink in &self.sinks {
            sink.record(report);
        }
    }
}

/// Handle to the report worker. Cheap to clone; every clone feeds the same
/// worker.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<TaskReport>,
    stop: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Reporter {
    /// Spawn the worker that hands every report to `sink`.
    pub fn start(sink: Arc<dyn ReportSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let worker = tokio::spawn(run_worker(rx, sink, stop.clone()));
        Self {
            tx,
            stop,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn new_report(&self) -> PendingReport {
        PendingReport {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting reports, record the ones already queued and wait for
    /// the worker to exit. Later calls return immediately.
    pub async fn stop_and_wait(&self) {
        self.stop.cancel();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "report worker panicked");
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<TaskReport>,
    sink: Arc<dyn ReportSink>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            report = rx.recv() => match report {
                Some(report) => sink.record(&report),
                None => return,
            },
        }
    }
    rx.close();
    while let Some(report) = rx.recv().await {
        sink.record(&report);
    }
    debug!("report worker stopped");
}

/// A report not yet tied to a task.
pub struct PendingReport {
    tx: mpsc::UnboundedSender<TaskReport>,
}

impl PendingReport {
    pub fn task_start(self, kind: TaskKind, job: &str) -> Report {
        Report {
            tx: self.tx,
            id: Uuid::now_v7(),
            kind,
            job: job.to_string(),
            repository_name: None,
            repository_id: None,
            snapshot_id: None,
            started_at: Utc::now(),
        }
    }
}

/// An in-flight task report. Finalising consumes it and queues the result.
pub struct Report {
    tx: mpsc::UnboundedSender<TaskReport>,
    id: Uuid,
    kind: TaskKind,
    job: String,
    repository_name: Option<String>,
    repository_id: Option<String>,
    snapshot_id: Option<String>,
    started_at: DateTime<Utc>,
}

impl Report {
    pub fn with_repository_name(mut self, name: &str) -> Self {
        self.repository_name = Some(name.to_string());
        self
    }

    pub fn with_repository(mut self, repository: &dyn Repository) -> Self {
        self.repository_id = Some(repository.id());
        if self.repository_name.is_none() {
            self.repository_name = Some(repository.name().to_string());
        }
        self
    }

    pub fn with_snapshot_id(mut self, id: &str) -> Self {
        self.snapshot_id = Some(id.to_string());
        self
    }

    pub fn task_done(self) {
        self.finish(ReportStatus::Done);
    }

    pub fn task_warning(self, message: impl Into<String>) {
        self.finish(ReportStatus::Warning {
            message: message.into(),
        });
    }

    pub fn task_failed(self, exit_code: i32, message: impl Into<String>) {
        self.finish(ReportStatus::Failed {
            exit_code,
            message: message.into(),
        });
    }

    fn finish(self, status: ReportStatus) {
        let report = TaskReport {
            id: self.id,
            kind: self.kind,
            job: self.job,
            repository_name: self.repository_name,
            repository_id: self.repository_id,
            snapshot_id: self.snapshot_id,
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
            status,
        };
        if self.tx.send(report).is_err() {
            debug!("report worker gone, report dropped");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use crate::repository::testing::FakeLoader;
    use crate::repository::RepositoryLoader;

    #[tokio::test]
    async fn queued_reports_are_recorded_before_stop_returns() {
        let sink = Arc::new(MemorySink::default());
        let reporter = Reporter::start(sink.clone());

        for i in 0..20 {
            reporter
                .new_report()
                .task_start(TaskKind::Check, &format!("job-{i}"))
                .task_done();
        }
        reporter.stop_and_wait().await;

        assert_eq!(sink.reports().len(), 20);
    }

    #[tokio::test]
    async fn report_carries_repository_and_status() {
        let sink = Arc::new(MemorySink::default());
        let reporter = Reporter::start(sink.clone());
        let loader = FakeLoader::default();
        let repo = loader.load("main").await.unwrap();

        reporter
            .new_report()
            .task_start(TaskKind::Backup, "nightly")
            .with_repository_name("main")
            .with_repository(repo.repository())
            .with_snapshot_id("abc123")
            .task_failed(2, "disk full");
        reporter.stop_and_wait().await;

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.kind, TaskKind::Backup);
        assert_eq!(report.job, "nightly");
        assert_eq!(report.repository_name.as_deref(), Some("main"));
        assert_eq!(report.repository_id.as_deref(), Some("id-main"));
        assert_eq!(report.snapshot_id.as_deref(), Some("abc123"));
        assert!(report.finished_at.unwrap() >= report.started_at);
        assert_eq!(
            report.status,
            ReportStatus::Failed {
                exit_code: 2,
                message: "disk full".into()
            }
        );
    }

    #[tokio::test]
    async fn reports_after_stop_are_dropped() {
        let sink = Arc::new(MemorySink::default());
        let reporter = Reporter::start(sink.clone());
        reporter.stop_and_wait().await;
        reporter.stop_and_wait().await;

        reporter
            .new_report()
            .task_start(TaskKind::Sync, "late")
            .task_warning("too late");
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn multi_sink_feeds_every_sink() {
        let first = Arc::new(MemorySink::default());
        let second = Arc::new(MemorySink::default());
        let sinks: Vec<Arc<dyn ReportSink>> = vec![
            first.clone() as Arc<dyn ReportSink>,
            second.clone() as Arc<dyn ReportSink>,
            Arc::new(TracingSink) as Arc<dyn ReportSink>,
        ];
        let reporter = Reporter::start(Arc::new(MultiSink::new(sinks)));
        reporter
            .new_report()
            .task_start(TaskKind::Restore, "drill")
            .task_done();
        reporter.stop_and_wait().await;

        assert_eq!(first.reports().len(), 1);
        assert_eq!(first.reports(), second.reports());
    }

    #[test]
    fn status_serialises_with_tag() {
        let json = serde_json::to_string(&ReportStatus::Warning {
            message: "purge failed".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"warning","message":"purge failed"}"#);
    }
}
