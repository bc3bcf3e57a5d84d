//! Single-owner scheduler context driven over a command channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ward_scheduler::{Backend, Configuration, ReportSink, SchedulerService};

use crate::error::ControlError;

type Reply = oneshot::Sender<Result<(), ControlError>>;

/// Starts a scheduler run for `config` under `token`.
pub trait SchedulerLauncher: Send + Sync {
    fn launch(&self, token: CancellationToken, config: Arc<Configuration>) -> JoinHandle<()>;
}

/// Launches a [`SchedulerService`] per run.
pub struct ServiceLauncher {
    backend: Backend,
    sink: Arc<dyn ReportSink>,
}

impl ServiceLauncher {
    pub fn new(backend: Backend, sink: Arc<dyn ReportSink>) -> Self {
        Self { backend, sink }
    }
}

impl SchedulerLauncher for ServiceLauncher {
    fn launch(&self, token: CancellationToken, config: Arc<Configuration>) -> JoinHandle<()> {
        let service = SchedulerService::new(token, config, self.backend.clone(), Arc::clone(&self.sink));
        tokio::spawn(service.run())
    }
}

enum Command {
    Start { reply: Reply },
    Stop { reply: Reply },
    Configure { config: Configuration, reply: Reply },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
}

/// Scheduler state shared by every control connection, owned by one task.
struct SchedulerContext {
    agent_token: CancellationToken,
    scheduler_token: Option<CancellationToken>,
    config: Option<Arc<Configuration>>,
    state: RunState,
    launcher: Arc<dyn SchedulerLauncher>,
    /// Every run launched so far that has not been reaped.
    runs: Vec<JoinHandle<()>>,
}

impl SchedulerContext {
    fn launch(&mut self, config: Arc<Configuration>) {
        let token = self.agent_token.child_token();
        self.runs.retain(|run| !run.is_finished());
        self.runs.push(self.launcher.launch(token.clone(), config));
        self.scheduler_token = Some(token);
        self.state = RunState::Running;
    }

    /// A run that cancelled its own token (e.g. a rejected sync direction)
    /// counts as stopped.
    fn is_running(&self) -> bool {
        self.state == RunState::Running
            && self
                .scheduler_token
                .as_ref()
                .is_some_and(|token| !token.is_cancelled())
    }

    fn start(&mut self) -> Result<(), ControlError> {
        let Some(config) = self.config.clone() else {
            return Err(ControlError::NotConfigured);
        };
        if self.is_running() {
            return Err(ControlError::AlreadyRunning);
        }
        self.launch(config);
        info!(jobs = self.config.as_ref().map_or(0, |c| c.jobs.len()), "scheduler started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ControlError> {
        if !self.is_running() {
            self.scheduler_token = None;
            self.state = RunState::Stopped;
            return Err(ControlError::NotRunning);
        }
        if let Some(token) = self.scheduler_token.take() {
            token.cancel();
        }
        self.state = RunState::Stopped;
        info!("scheduler stopped");
        Ok(())
    }

    fn configure(&mut self, config: Configuration) {
        let config = Arc::new(config);
        if self.is_running() {
            if let Some(token) = self.scheduler_token.take() {
                token.cancel();
            }
            self.launch(Arc::clone(&config));
            info!(jobs = config.jobs.len(), "scheduler relaunched with new configuration");
        } else {
            self.scheduler_token = None;
            self.state = RunState::Stopped;
            info!(jobs = config.jobs.len(), "configuration stored");
        }
        self.config = Some(config);
    }

    fn handle(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Start { reply } => (self.start(), reply),
            Command::Stop { reply } => (self.stop(), reply),
            Command::Configure { config, reply } => {
                self.configure(config);
                (Ok(()), reply)
            }
        };
        if reply.send(result).is_err() {
            debug!("control client went away before the reply");
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;
                _ = self.agent_token.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        if let Some(token) = self.scheduler_token.take() {
            token.cancel();
        }
        for run in self.runs.drain(..) {
            if let Err(e) = run.await {
                warn!(error = %e, "scheduler run panicked");
            }
        }
        debug!("controller stopped");
    }
}

/// Cheap, cloneable front door to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    agent_token: CancellationToken,
}

impl ControllerHandle {
    pub async fn start(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::Start { reply }).await
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn configure(&self, config: Configuration) -> Result<(), ControlError> {
        self.request(|reply| Command::Configure { config, reply }).await
    }

    /// Shut the whole agent down.
    pub fn terminate(&self) {
        info!("terminate requested");
        self.agent_token.cancel();
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), ControlError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ControlError::ControllerGone)?;
        response.await.map_err(|_| ControlError::ControllerGone)?
    }
}

/// Spawn the controller task. It runs until `agent_token` is cancelled, then
/// cancels the active scheduler and waits for every run it launched.
pub fn spawn(
    agent_token: CancellationToken,
    launcher: Arc<dyn SchedulerLauncher>,
) -> (ControllerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let context = SchedulerContext {
        agent_token: agent_token.clone(),
        scheduler_token: None,
        config: None,
        state: RunState::Stopped,
        launcher,
        runs: Vec::new(),
    };
    let task = tokio::spawn(context.run(rx));
    (
        ControllerHandle {
            commands: tx,
            agent_token,
        },
        task,
    )
}
