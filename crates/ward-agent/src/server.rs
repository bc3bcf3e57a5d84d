//! Control-plane listener on a local Unix socket.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::unix::SocketAddr;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ward_core::config::HANDSHAKE_TIMEOUT_MS;
use ward_protocol::{codec, methods, Hello, Request, Response};
use ward_scheduler::Configuration;

use crate::controller::ControllerHandle;
use crate::error::ControlError;

/// Accept control connections on `socket` until `shutdown` is cancelled or
/// accepting fails.
///
/// A socket file left behind by a dead agent is removed before binding; a
/// live agent on the same path is an error. The socket file is removed
/// again once every in-flight connection has finished.
pub async fn listen_and_serve(
    socket: &Path,
    controller: ControllerHandle,
    version: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if socket.exists() {
        if UnixStream::connect(socket).await.is_ok() {
            bail!("an agent is already listening on {}", socket.display());
        }
        std::fs::remove_file(socket)
            .with_context(|| format!("failed to remove stale socket {}", socket.display()))?;
        debug!(socket = %socket.display(), "removed stale socket");
    }
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    info!(socket = %socket.display(), %version, "agent listening");

    let served = {
        let listener = &listener;
        serve_connections(move || listener.accept(), controller, Arc::from(version), shutdown).await
    };

    drop(listener);
    if let Err(e) = std::fs::remove_file(socket) {
        debug!(error = %e, "socket already removed");
    }
    served
}

/// Decrements the in-flight counter when a handler ends, panics included.
struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(Arc::clone(counter)), active)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept loop. Returns once `shutdown` fires or `accept` fails, after every
/// in-flight connection has finished.
async fn serve_connections<A, F>(
    mut accept: A,
    controller: ControllerHandle,
    version: Arc<str>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(UnixStream, SocketAddr)>>,
{
    let inflight = Arc::new(AtomicUsize::new(0));
    let mut handlers = JoinSet::new();
    let mut next_conn_id: u64 = 0;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            accepted = accept() => match accepted {
                Ok((stream, _)) => {
                    next_conn_id += 1;
                    let conn_id = next_conn_id;
                    let controller = controller.clone();
                    let version = Arc::clone(&version);
                    let (guard, active) = InflightGuard::enter(&inflight);
                    debug!(conn_id, active, "control connection accepted");
                    handlers.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = handle_client(stream, &controller, &version).await {
                            warn!(conn_id, error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed, closing listener");
                    break Err(anyhow::Error::new(e).context("accept failed"));
                }
            },
        }
        while let Some(joined) = handlers.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "control handler panicked");
            }
        }
    };

    info!(inflight = inflight.load(Ordering::SeqCst), "listener closed, draining connections");
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "control handler panicked");
        }
    }
    outcome
}

/// One exchange: hello both ways, one request, one response.
async fn handle_client(
    stream: UnixStream,
    controller: &ControllerHandle,
    version: &str,
) -> anyhow::Result<()> {
    let read_timeout = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let mut stream = codec::framed(stream);

    let hello: Hello = timeout(read_timeout, codec::recv(&mut stream))
        .await
        .context("timed out waiting for client hello")??;
    codec::send(&mut stream, &Hello::new(version)).await?;
    if hello.version != version {
        debug!(client = %hello.version, agent = %version, "client version differs");
    }

    let request: Request = timeout(read_timeout, codec::recv(&mut stream))
        .await
        .context("timed out waiting for request")??;
    info!(request = %request.kind, "control request");
    let response = dispatch(controller, request).await;
    codec::send(&mut stream, &response).await?;
    Ok(())
}

async fn dispatch(controller: &ControllerHandle, request: Request) -> Response {
    let result = match request.kind.as_str() {
        methods::START => controller.start().await,
        methods::STOP => controller.stop().await,
        methods::CONFIGURE => match Configuration::from_json(&request.payload) {
            Ok(config) => controller.configure(config).await,
            Err(e) => Err(ControlError::InvalidConfiguration(e.to_string())),
        },
        methods::TERMINATE => {
            controller.terminate();
            Ok(())
        }
        other => Err(ControlError::UnknownCommand(other.to_string())),
    };
    match result {
        Ok(()) => Response::ok(),
        Err(e) => {
            debug!(error = %e, "control request rejected");
            Response::err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::send_request;
    use crate::controller::{self, testing::CountingLauncher};
    use tokio::task::JoinHandle;

    struct Agent {
        _dir: tempfile::TempDir,
        socket: std::path::PathBuf,
        token: CancellationToken,
        launcher: Arc<CountingLauncher>,
        server: JoinHandle<anyhow::Result<()>>,
    }

    async fn agent() -> Agent {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("scheduler.sock");
        let token = CancellationToken::new();
        let launcher = Arc::new(CountingLauncher::default());
        let (controller, _task) = controller::spawn(token.clone(), launcher.clone());
        let server = tokio::spawn({
            let socket = socket.clone();
            let token = token.clone();
            async move { listen_and_serve(&socket, controller, "test".into(), token).await }
        });
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Agent {
            _dir: dir,
            socket,
            token,
            launcher,
            server,
        }
    }

    fn nightly_payload() -> Vec<u8> {
        Configuration::from_toml_str(
            r#"
            [jobs.nightly]
            repository = "main"
            [[jobs.nightly.schedules]]
            hours = [2]
            minutes = [0]
            [jobs.nightly.backup]
            path = "/home"
            "#,
        )
        .unwrap()
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn start_before_configure_is_rejected() {
        let agent = agent().await;
        let response = send_request(&agent.socket, &Request::start()).await.unwrap();
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.err, "agent scheduler does not have a configuration");
        agent.token.cancel();
    }

    #[tokio::test]
    async fn configure_then_start_then_stop() {
        let agent = agent().await;

        let response = send_request(&agent.socket, &Request::configure(nightly_payload()))
            .await
            .unwrap();
        assert!(response.is_ok(), "{}", response.err);
        assert!(send_request(&agent.socket, &Request::start()).await.unwrap().is_ok());
        assert_eq!(agent.launcher.launched(), 1);

        let again = send_request(&agent.socket, &Request::start()).await.unwrap();
        assert_eq!(again.err, "agent scheduler already running");
        assert!(send_request(&agent.socket, &Request::stop()).await.unwrap().is_ok());
        assert_eq!(agent.launcher.cancelled(), 1);
        agent.token.cancel();
    }

    #[tokio::test]
    async fn unknown_command_and_bad_payload_are_errors() {
        let agent = agent().await;

        let response = send_request(&agent.socket, &Request::new("reboot", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.err, "unknown command: reboot");

        let response = send_request(&agent.socket, &Request::configure(b"not json".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.exit_code, 1);
        assert!(response.err.starts_with("Invalid configuration"));

        // nothing was stored
        let response = send_request(&agent.socket, &Request::start()).await.unwrap();
        assert_eq!(response.err, "agent scheduler does not have a configuration");
        agent.token.cancel();
    }

    #[tokio::test]
    async fn terminate_shuts_the_listener_down() {
        let agent = agent().await;
        let response = send_request(&agent.socket, &Request::terminate()).await.unwrap();
        assert!(response.is_ok());

        tokio::time::timeout(Duration::from_secs(5), agent.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(agent.token.is_cancelled());
        assert!(!agent.socket.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("scheduler.sock");
        // a bound-then-dropped listener leaves its file behind
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let token = CancellationToken::new();
        let (controller, _task) =
            controller::spawn(token.clone(), Arc::new(CountingLauncher::default()));
        let server = tokio::spawn({
            let socket = socket.clone();
            let token = token.clone();
            async move { listen_and_serve(&socket, controller, "test".into(), token).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = send_request(&socket, &Request::stop()).await.unwrap();
        assert_eq!(response.err, "agent scheduler not running");
        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_agent_on_a_live_socket_fails() {
        let agent = agent().await;
        let token = CancellationToken::new();
        let (controller, _task) =
            controller::spawn(token.clone(), Arc::new(CountingLauncher::default()));
        let err = listen_and_serve(&agent.socket, controller, "test".into(), token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already listening"));
        agent.token.cancel();
    }

    #[tokio::test]
    async fn accept_failure_ends_the_loop() {
        let token = CancellationToken::new();
        let (controller, _task) =
            controller::spawn(token.clone(), Arc::new(CountingLauncher::default()));
        let mut attempts = 0;
        let accept = || {
            attempts += 1;
            std::future::ready(Err::<(UnixStream, SocketAddr), _>(io::Error::other(
                "too many open files",
            )))
        };

        let err = timeout(
            Duration::from_secs(5),
            serve_connections(accept, controller, Arc::from("test"), token.clone()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(format!("{err:#}").contains("too many open files"));
        assert!(!token.is_cancelled());
        token.cancel();
    }

    #[tokio::test]
    async fn inflight_count_survives_a_panicking_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (guard, active) = InflightGuard::enter(&counter);
        assert_eq!(active, 1);

        let joined = tokio::spawn(async move {
            let _guard = guard;
            panic!("handler blew up");
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
