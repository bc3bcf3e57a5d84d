use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::reporting::{ReportSink, ReportStatus, TaskReport};

/// Initialise the report history schema in `conn`.
///
/// Creates the `task_reports` table (idempotent) and an index on
/// `started_at` for newest-first listing.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_reports (
            id              TEXT    NOT NULL PRIMARY KEY,
            kind            TEXT    NOT NULL,
            job             TEXT    NOT NULL,
            repository_name TEXT,
            repository_id   TEXT,
            snapshot_id     TEXT,
            started_at      TEXT    NOT NULL,   -- ISO-8601
            finished_at     TEXT,               -- ISO-8601 or NULL
            status          TEXT    NOT NULL,   -- done | warning | failed
            exit_code       INTEGER NOT NULL DEFAULT 0,
            message         TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_task_reports_started ON task_reports (started_at);
        ",
    )?;
    Ok(())
}

/// Persists every report to SQLite.
pub struct SqliteReportSink {
    conn: Mutex<Connection>,
}

impl SqliteReportSink {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn insert(&self, report: &TaskReport) -> Result<()> {
        let (exit_code, message) = match &report.status {
            ReportStatus::Done => (0, None),
            ReportStatus::Warning { message } => (0, Some(message.as_str())),
            ReportStatus::Failed { exit_code, message } => (*exit_code, Some(message.as_str())),
        };
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO task_reports
             (id, kind, job, repository_name, repository_id, snapshot_id,
              started_at, finished_at, status, exit_code, message)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                report.id.to_string(),
                report.kind.as_str(),
                report.job,
                report.repository_name,
                report.repository_id,
                report.snapshot_id,
                timestamp(&report.started_at),
                report.finished_at.as_ref().map(timestamp),
                report.status.as_str(),
                exit_code,
                message,
            ],
        )?;
        Ok(())
    }

    /// Most recent reports first, at most `limit`.
    ///
    /// Rows whose fields no longer decode are logged and skipped; SQLite
    /// errors are returned.
    pub fn recent(&self, limit: usize) -> Result<Vec<TaskReport>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, kind, job, repository_name, repository_id, snapshot_id,
                    started_at, finished_at, status, exit_code, message
             FROM task_reports ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(StoredReport {
                id: row.get(0)?,
                kind: row.get(1)?,
                job: row.get(2)?,
                repository_name: row.get(3)?,
                repository_id: row.get(4)?,
                snapshot_id: row.get(5)?,
                started_at: row.get(6)?,
                finished_at: row.get(7)?,
                status: row.get(8)?,
                exit_code: row.get(9)?,
                message: row.get(10)?,
            })
        })?;

        let mut reports = Vec::new();
        for row in rows {
            let row = row?;
            let id = row.id.clone();
            match row.decode() {
                Ok(report) => reports.push(report),
                Err(reason) => warn!(%id, %reason, "skipping unreadable task report"),
            }
        }
        Ok(reports)
    }
}

/// One `task_reports` row as stored.
struct StoredReport {
    id: String,
    kind: String,
    job: String,
    repository_name: Option<String>,
    repository_id: Option<String>,
    snapshot_id: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    exit_code: i32,
    message: Option<String>,
}

impl StoredReport {
    fn decode(self) -> std::result::Result<TaskReport, String> {
        let message = self.message.unwrap_or_default();
        let status = match self.status.as_str() {
            "done" => ReportStatus::Done,
            "warning" => ReportStatus::Warning { message },
            "failed" => ReportStatus::Failed {
                exit_code: self.exit_code,
                message,
            },
            other => return Err(format!("unknown status {other:?}")),
        };
        let finished_at = match self.finished_at.as_deref() {
            Some(t) => Some(parse_time(t).ok_or_else(|| format!("bad finished_at {t:?}"))?),
            None => None,
        };
        Ok(TaskReport {
            id: Uuid::parse_str(&self.id).map_err(|e| format!("bad id: {e}"))?,
            kind: self
                .kind
                .parse()
                .map_err(|_| format!("unknown kind {:?}", self.kind))?,
            job: self.job,
            repository_name: self.repository_name,
            repository_id: self.repository_id,
            snapshot_id: self.snapshot_id,
            started_at: parse_time(&self.started_at)
                .ok_or_else(|| format!("bad started_at {:?}", self.started_at))?,
            finished_at,
            status,
        })
    }
}

/// Fixed-width so text order is time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl ReportSink for SqliteReportSink {
    fn record(&self, report: &TaskReport) {
        if let Err(e) = self.insert(report) {
            warn!(job = %report.job, error = %e, "failed to persist task report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskKind;
    use chrono::Duration;

    fn report(job: &str, started_at: DateTime<Utc>, status: ReportStatus) -> TaskReport {
        TaskReport {
            id: Uuid::new_v4(),
            kind: TaskKind::Backup,
            job: job.to_string(),
            repository_name: Some("main".into()),
            repository_id: None,
            snapshot_id: Some("snap".into()),
            started_at,
            finished_at: Some(started_at + Duration::seconds(5)),
            status,
        }
    }

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn recent_lists_newest_first() {
        let sink = SqliteReportSink::new(Connection::open_in_memory().unwrap()).unwrap();
        let base = Utc::now();
        sink.record(&report("old", base - Duration::hours(2), ReportStatus::Done));
        sink.record(&report(
            "new",
            base,
            ReportStatus::Failed {
                exit_code: 4,
                message: "no space".into(),
            },
        ));
        sink.record(&report(
            "mid",
            base - Duration::hours(1),
            ReportStatus::Warning {
                message: "purge failed".into(),
            },
        ));

        let recent = sink.recent(2).unwrap();
        let jobs: Vec<_> = recent.iter().map(|r| r.job.as_str()).collect();
        assert_eq!(jobs, ["new", "mid"]);
        assert_eq!(
            recent[0].status,
            ReportStatus::Failed {
                exit_code: 4,
                message: "no space".into()
            }
        );
        assert_eq!(recent[0].repository_name.as_deref(), Some("main"));
        assert!(recent[0].finished_at.is_some());
    }

    #[test]
    fn duplicate_id_is_logged_not_fatal() {
        let sink = SqliteReportSink::new(Connection::open_in_memory().unwrap()).unwrap();
        let r = report("dup", Utc::now(), ReportStatus::Done);
        sink.record(&r);
        sink.record(&r);
        assert_eq!(sink.recent(10).unwrap().len(), 1);
        assert!(sink.insert(&r).is_err());
    }

    #[test]
    fn undecodable_rows_are_skipped() {
        let sink = SqliteReportSink::new(Connection::open_in_memory().unwrap()).unwrap();
        let started = Utc::now();
        sink.record(&report("good", started, ReportStatus::Done));
        {
            let conn = sink.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO task_reports (id, kind, job, started_at, status)
                 VALUES (?1, 'backup', 'bad-status', ?2, 'exploded')",
                params![Uuid::new_v4().to_string(), timestamp(&started)],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO task_reports (id, kind, job, started_at, status)
                 VALUES ('not-a-uuid', 'backup', 'bad-id', ?1, 'done')",
                params![timestamp(&started)],
            )
            .unwrap();
        }

        let recent = sink.recent(10).unwrap();
        let jobs: Vec<_> = recent.iter().map(|r| r.job.as_str()).collect();
        assert_eq!(jobs, ["good"]);
    }

    #[test]
    fn query_errors_are_returned() {
        let sink = SqliteReportSink::new(Connection::open_in_memory().unwrap()).unwrap();
        sink.conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE task_reports")
            .unwrap();
        assert!(sink.recent(10).is_err());
    }
}
