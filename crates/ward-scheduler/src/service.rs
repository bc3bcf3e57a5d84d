use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventHandle, TimedEvents};
use crate::reporting::{ReportSink, Reporter};
use crate::schedule::next_midnight;
use crate::tasks::{run_task, task_loop, Backend};
use crate::types::{Configuration, Job, TaskKind};

/// Capacity of the job-ready delivery channel.
const RUNQ_CAPACITY: usize = 1000;

/// A calendar trigger armed on the job-ready engine.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub scheduled: DateTime<Local>,
    pub job: Arc<Job>,
    pub handle: EventHandle,
}

/// Jobs and the job-ready engine, shared by the dispatch loop and the
/// rollover task.
struct Planner {
    jobs: Vec<Arc<Job>>,
    runq: TimedEvents<ScheduledJob>,
    /// (job, instant) pairs currently pending on the job-ready engine.
    armed: Mutex<HashSet<(String, DateTime<Utc>)>>,
}

impl Planner {
    fn armed_set(&self) -> MutexGuard<'_, HashSet<(String, DateTime<Utc>)>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm one job-ready event unless the same (job, instant) is pending.
    fn arm(&self, job: &Arc<Job>, at: DateTime<Local>) -> bool {
        if !self.armed_set().insert((job.name.clone(), at.with_timezone(&Utc))) {
            return false;
        }
        let job = Arc::clone(job);
        let handle = self.runq.schedule_with(at, |handle| ScheduledJob {
            scheduled: at,
            job,
            handle,
        });
        debug!(?handle, %at, "job-ready event armed");
        true
    }

    fn disarm(&self, ready: &ScheduledJob) {
        self.armed_set()
            .remove(&(ready.job.name.clone(), ready.scheduled.with_timezone(&Utc)));
    }

    fn schedule_for_date(&self, date: DateTime<Local>) -> usize {
        let mut armed = 0;
        for job in &self.jobs {
            if job.schedules.is_empty() {
                continue;
            }
            if job.backup.is_none() {
                warn!(job = %job.name, "job has schedules but no backup task, not planning");
                continue;
            }
            for schedule in &job.schedules {
                for at in schedule.plan_for_date(&date) {
                    if at < date {
                        debug!(job = %job.name, %at, "skipping past-due instant");
                        continue;
                    }
                    if self.arm(job, at) {
                        armed += 1;
                    }
                }
            }
        }
        armed
    }
}

/// Re-plan the day after every rollover tick and arm the next tick.
///
/// Runs apart from job dispatch so a long backup never holds up planning.
async fn rollover_loop(
    planner: Arc<Planner>,
    rollover: Arc<TimedEvents<DateTime<Local>>>,
    mut ticks: mpsc::Receiver<DateTime<Local>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            tick = ticks.recv() => match tick {
                Some(day) => {
                    let next = next_midnight(&day);
                    let planned = planner.schedule_for_date(next);
                    info!(date = %next.date_naive(), planned, "planned next day");
                    rollover.schedule_at(next, next);
                }
                None => break,
            },
        }
    }
    debug!("rollover task stopped");
}

/// Runs one configuration until its token is cancelled.
///
/// Two timed-event engines cooperate: the rollover engine fires once per
/// local calendar day and re-plans every job's schedules for the next day;
/// the job-ready engine delivers the planned instants, which are dispatched
/// one at a time in time order. Interval-driven tasks run in their own loops.
pub struct SchedulerService {
    token: CancellationToken,
    backend: Backend,
    sink: Arc<dyn ReportSink>,
    planner: Arc<Planner>,
    runq_rx: mpsc::Receiver<ScheduledJob>,
    rollover: Arc<TimedEvents<DateTime<Local>>>,
    rollover_rx: mpsc::Receiver<DateTime<Local>>,
}

impl SchedulerService {
    pub fn new(
        token: CancellationToken,
        config: Arc<Configuration>,
        backend: Backend,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let mut jobs: Vec<Arc<Job>> = config
            .jobs
            .iter()
            .map(|(name, job)| {
                let mut job = job.clone();
                job.name = name.clone();
                Arc::new(job)
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));

        let (runq_tx, runq_rx) = mpsc::channel(RUNQ_CAPACITY);
        let (rollover_tx, rollover_rx) = mpsc::channel(1);
        Self {
            token,
            backend,
            sink,
            planner: Arc::new(Planner {
                jobs,
                runq: TimedEvents::new(runq_tx),
                armed: Mutex::new(HashSet::new()),
            }),
            runq_rx,
            rollover: Arc::new(TimedEvents::new(rollover_tx)),
            rollover_rx,
        }
    }

    /// Expand every job's schedules for the calendar day of `date` and arm a
    /// job-ready event per instant. Instants before `date` are skipped, as
    /// are instants already armed. Returns the number of new events.
    pub fn schedule_for_date(&self, date: DateTime<Local>) -> usize {
        self.planner.schedule_for_date(date)
    }

    /// Job-ready events currently pending.
    pub fn armed(&self) -> usize {
        self.planner.armed_set().len()
    }

    /// Run until the token is cancelled, then shut down: stop both engines,
    /// wait for every task loop and flush pending reports.
    pub async fn run(self) {
        self.run_from(Local::now()).await
    }

    /// [`run`](Self::run) with `today` as the planning instant of the first
    /// day. The first rollover tick fires at once and plans the day after.
    async fn run_from(self, today: DateTime<Local>) {
        let SchedulerService {
            token,
            backend,
            sink,
            planner,
            mut runq_rx,
            rollover,
            rollover_rx,
        } = self;
        let reporter = Reporter::start(sink);

        let runq_done = match planner.runq.start() {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "failed to start job-ready engine");
                reporter.stop_and_wait().await;
                return;
            }
        };
        let rollover_done = match rollover.start() {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "failed to start rollover engine");
                planner.runq.stop();
                let _ = runq_done.await;
                reporter.stop_and_wait().await;
                return;
            }
        };

        let planned = planner.schedule_for_date(today);
        info!(jobs = planner.jobs.len(), planned, "scheduler started");
        rollover.schedule_at(today, Local::now());
        let rollover_task = tokio::spawn(rollover_loop(
            Arc::clone(&planner),
            Arc::clone(&rollover),
            rollover_rx,
            token.clone(),
        ));

        let mut loops = JoinSet::new();
        for job in &planner.jobs {
            for kind in job.kinds() {
                if let Some(every) = job.interval(kind) {
                    loops.spawn(task_loop(
                        Arc::clone(job),
                        kind,
                        every,
                        backend.clone(),
                        reporter.clone(),
                        token.clone(),
                    ));
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(ready) = runq_rx.recv() => {
                    dispatch(&planner, &backend, ready, &reporter).await;
                }
            }
        }

        info!("scheduler stopping");
        planner.runq.stop();
        rollover.stop();
        let _ = runq_done.await;
        let _ = rollover_done.await;
        if let Err(e) = rollover_task.await {
            error!(error = %e, "rollover task panicked");
        }
        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "task loop panicked");
            }
        }
        reporter.stop_and_wait().await;
        info!("scheduler stopped");
    }
}

async fn dispatch(planner: &Planner, backend: &Backend, ready: ScheduledJob, reporter: &Reporter) {
    planner.disarm(&ready);
    info!(job = %ready.job.name, scheduled = %ready.scheduled, "job ready");
    if let Err(e) = run_task(&ready.job, TaskKind::Backup, backend, reporter).await {
        error!(job = %ready.job.name, error = %e, "scheduled backup not run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::testing::ScriptedOperations;
    use crate::operations::{OperationError, Operations, Outcome, TaskRequest};
    use crate::reporting::testing::MemorySink;
    use crate::reporting::ReportStatus;
    use crate::repository::testing::FakeLoader;
    use crate::repository::Repository;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike};
    use std::time::Duration;
    use tokio::sync::Notify;

    const NIGHTLY: &str = r#"
        [jobs.nightly]
        repository = "main"

        [[jobs.nightly.schedules]]
        hours = [2]
        minutes = [0]

        [jobs.nightly.backup]
        path = "/home"
    "#;

    fn service_with(
        document: &str,
        ops: Arc<dyn Operations>,
    ) -> (SchedulerService, FakeLoader, Arc<MemorySink>) {
        let config = Arc::new(Configuration::from_toml_str(document).unwrap());
        let loader = FakeLoader::default();
        let sink = Arc::new(MemorySink::default());
        let service = SchedulerService::new(
            CancellationToken::new(),
            config,
            Backend::new(Arc::new(loader.clone()), ops),
            sink.clone(),
        );
        (service, loader, sink)
    }

    fn service(document: &str) -> (SchedulerService, FakeLoader, Arc<ScriptedOperations>, Arc<MemorySink>) {
        let ops = Arc::new(ScriptedOperations::default());
        let (service, loader, sink) = service_with(document, ops.clone());
        (service, loader, ops, sink)
    }

    /// Backups that block until released.
    #[derive(Default)]
    struct GatedOperations {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Operations for GatedOperations {
        async fn execute(
            &self,
            _repository: &dyn Repository,
            _request: &TaskRequest,
        ) -> std::result::Result<Outcome, OperationError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Outcome::success())
        }
    }

    async fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn key(job: &str, at: DateTime<Local>) -> (String, DateTime<Utc>) {
        (job.to_string(), at.with_timezone(&Utc))
    }

    fn local(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).earliest().unwrap()
    }

    #[test]
    fn nightly_job_plans_one_event() {
        let (svc, ..) = service(NIGHTLY);
        assert_eq!(svc.schedule_for_date(local(2024, 1, 10, 0)), 1);
        assert_eq!(svc.armed(), 1);
        assert_eq!(svc.planner.runq.pending(), 1);

        let (job, at) = svc.planner.armed_set().iter().next().unwrap().clone();
        let at = at.with_timezone(&Local);
        assert_eq!(job, "nightly");
        assert_eq!(at.date_naive(), local(2024, 1, 10, 0).date_naive());
        assert_eq!((at.hour(), at.minute()), (2, 0));
    }

    #[test]
    fn replanning_the_same_day_arms_nothing_new() {
        let (svc, ..) = service(NIGHTLY);
        let day = local(2024, 1, 10, 0);
        assert_eq!(svc.schedule_for_date(day), 1);
        assert_eq!(svc.schedule_for_date(day), 0);
        assert_eq!(svc.armed(), 1);
        assert_eq!(svc.planner.runq.pending(), 1);
    }

    #[test]
    fn instants_before_the_planning_time_are_skipped() {
        let (svc, ..) = service(NIGHTLY);
        assert_eq!(svc.schedule_for_date(local(2024, 1, 10, 3)), 0);
        assert_eq!(svc.planner.runq.pending(), 0);
    }

    #[test]
    fn jobs_without_backup_are_not_planned() {
        let (svc, ..) = service(
            r#"
            [jobs.orphan]
            repository = "main"
            [[jobs.orphan.schedules]]
            hours = [4]
            "#,
        );
        assert_eq!(svc.schedule_for_date(local(2024, 1, 10, 0)), 0);
    }

    #[tokio::test]
    async fn dispatch_runs_backup_and_reports_done() {
        let (mut svc, loader, ops, sink) = service(NIGHTLY);
        ops.respond("backup", Outcome::success().with_snapshot_id("snap-42"));
        let reporter = Reporter::start(sink.clone());
        svc.schedule_for_date(local(2024, 1, 10, 0));

        // the 02:00 instant is long past, so the engine delivers it at once
        svc.planner.runq.start().unwrap();
        let ready = svc.runq_rx.recv().await.unwrap();
        assert_eq!(ready.scheduled, local(2024, 1, 10, 2));
        assert_eq!(ready.job.name, "nightly");
        dispatch(&svc.planner, &svc.backend, ready, &reporter).await;
        reporter.stop_and_wait().await;

        assert_eq!(svc.armed(), 0);
        assert_eq!(loader.counters.opened(), 1);
        assert_eq!(loader.counters.store_closed(), 1);
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, TaskKind::Backup);
        assert_eq!(reports[0].status, ReportStatus::Done);
        assert_eq!(reports[0].snapshot_id.as_deref(), Some("snap-42"));
    }

    #[tokio::test]
    async fn run_drives_interval_loops_and_flushes_on_cancel() {
        let (svc, loader, _ops, sink) = service(
            r#"
            [jobs.hourly]
            repository = "main"
            [jobs.hourly.check]
            latest = true
            interval_secs = 1
            "#,
        );
        let token = svc.token.clone();
        let handle = tokio::spawn(svc.run());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let reports = sink.reports();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.kind == TaskKind::Check));
        assert_eq!(reports.len(), loader.counters.opened());
        assert_eq!(loader.counters.store_closed(), loader.counters.opened());
    }

    #[tokio::test]
    async fn invalid_sync_direction_ends_the_run() {
        let (svc, loader, ..) = service(
            r#"
            [jobs.mirror]
            repository = "main"
            [jobs.mirror.sync]
            peer = "s3://offsite"
            direction = "sideways"
            interval_secs = 60
            "#,
        );
        let token = svc.token.clone();

        tokio::time::timeout(Duration::from_secs(5), svc.run())
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(loader.counters.opened(), 0);
    }

    #[tokio::test]
    async fn run_plans_today_and_the_next_day_once() {
        let (svc, ..) = service(NIGHTLY);
        let planner = Arc::clone(&svc.planner);
        let rollover = Arc::clone(&svc.rollover);
        let token = svc.token.clone();
        let handle = tokio::spawn(svc.run_from(local(2099, 1, 10, 0)));

        assert!(eventually(|| planner.armed_set().len() == 2).await);
        {
            let armed = planner.armed_set();
            assert!(armed.contains(&key("nightly", local(2099, 1, 10, 2))));
            assert!(armed.contains(&key("nightly", local(2099, 1, 11, 2))));
        }
        // the following tick waits for 2099-01-11 00:00
        assert!(eventually(|| rollover.pending() == 1).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(planner.armed_set().len(), 2);
        assert_eq!(planner.runq.pending(), 2);
        assert_eq!(rollover.pending(), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn rollover_plans_while_a_backup_is_running() {
        let ops = Arc::new(GatedOperations::default());
        let (svc, loader, sink) = service_with(NIGHTLY, ops.clone());
        let planner = Arc::clone(&svc.planner);
        let rollover = Arc::clone(&svc.rollover);
        let token = svc.token.clone();

        // past due, so it is dispatched as soon as the run starts
        let job = Arc::clone(&planner.jobs[0]);
        assert!(planner.arm(&job, local(2024, 1, 10, 2)));
        let handle = tokio::spawn(svc.run_from(local(2099, 1, 10, 0)));
        tokio::time::timeout(Duration::from_secs(2), ops.entered.notified())
            .await
            .unwrap();

        rollover.schedule_at(local(2099, 2, 1, 0), Local::now());
        assert!(eventually(|| planner.armed_set().contains(&key("nightly", local(2099, 2, 2, 2)))).await);
        assert!(sink.reports().is_empty());
        assert_eq!(loader.counters.store_closed(), 0);

        ops.release.notify_one();
        assert!(eventually(|| loader.counters.store_closed() == 1).await);
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Done);
    }
}
