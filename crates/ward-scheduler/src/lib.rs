//! `ward-scheduler` — calendar and interval scheduling of backup tasks.
//!
//! # Overview
//!
//! A [`service::SchedulerService`] runs one [`types::Configuration`] until its
//! cancellation token fires. Calendar schedules are expanded once per local
//! day into concrete instants and delivered by a [`events::TimedEvents`]
//! engine; interval tasks run in their own loops. Every run opens the job's
//! repository, performs the operation, optionally purges old snapshots and
//! finishes a report.
//!
//! # Task kinds
//!
//! | Kind          | Triggered by          | Retention purge |
//! |---------------|-----------------------|-----------------|
//! | `backup`      | schedules + interval  | yes             |
//! | `check`       | interval              | no              |
//! | `restore`     | interval              | no              |
//! | `sync`        | interval              | no              |
//! | `maintenance` | interval              | yes             |

pub mod db;
pub mod error;
pub mod events;
pub mod operations;
pub mod reporting;
pub mod repository;
pub mod schedule;
pub mod service;
pub mod tasks;
pub mod types;

pub use db::SqliteReportSink;
pub use error::{Result, SchedulerError};
pub use events::{EventHandle, TimedEvents};
pub use operations::{OperationError, Operations, Outcome, TaskRequest};
pub use reporting::{MultiSink, ReportSink, ReportStatus, Reporter, TaskReport, TracingSink};
pub use repository::{LoadedRepository, Repository, RepositoryLoader, Store};
pub use schedule::{DateMask, Schedule};
pub use service::{ScheduledJob, SchedulerService};
pub use tasks::Backend;
pub use types::{Configuration, Job, SyncDirection, TaskKind};
