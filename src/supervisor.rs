use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Output markers nginx uses for configuration errors
const FAILURE_MARKERS: &[&str] = &["[emerg]", "[alert]"];

/// Lifecycle of the supervised proxy process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// `start` has not been called
    NotStarted,
    /// The proxy process is running
    Running,
    /// A reload command is in flight
    Reloading,
    /// The proxy process has exited; there is no restart
    Dead,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid proxy command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy has already been started")]
    AlreadyStarted,

    #[error("proxy is not running")]
    NotRunning,

    #[error("reload exited with {status}: {}", .output.join(" | "))]
    ReloadFailed { status: String, output: Vec<String> },

    #[error("proxy rejected the new configuration: {}", .output.join(" | "))]
    ConfigRejected { output: Vec<String> },

    #[error("reload did not finish within {0:?}")]
    ReloadTimeout(Duration),

    #[error("failed waiting for reload: {0}")]
    Io(#[from] std::io::Error),
}

/// Output captured from a successful reload
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub output: Vec<String>,
    pub duration: Duration,
}

/// Anything that can make the proxy pick up new configuration
pub trait Reloader: Send + Sync {
    fn reload(&self) -> BoxFuture<'_, Result<ReloadReport, SupervisorError>>;
}

/// A program and its arguments, parsed from a shell-style string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    program: String,
    args: Vec<String>,
}

impl ProxyCommand {
    pub fn parse(command: &str) -> Result<Self, SupervisorError> {
        let invalid = |reason: String| SupervisorError::InvalidCommand {
            command: command.to_string(),
            reason,
        };

        let mut words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
        if words.is_empty() {
            return Err(invalid("command is empty".to_string()));
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// Supervises the long-running proxy process and issues reloads.
///
/// `start` spawns the proxy and streams its output onto the log for as long
/// as it runs. An exit is never followed by a restart: callers observe it via
/// [`wait_for_exit`](ProxySupervisor::wait_for_exit) and treat it as fatal.
/// `reload` runs a separate short-lived control command under a timeout.
pub struct ProxySupervisor {
    start_command: ProxyCommand,
    reload_command: ProxyCommand,
    reload_timeout: Duration,
    grace_period: Duration,
    state: Mutex<ProxyState>,
    pid: Mutex<Option<u32>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopping: AtomicBool,
    exit_tx: watch::Sender<Option<String>>,
    // Serialises reloads; the registry already holds its write lock, SIGHUP does not
    reload_lock: tokio::sync::Mutex<()>,
}

impl ProxySupervisor {
    pub fn new(
        start_command: ProxyCommand,
        reload_command: ProxyCommand,
        reload_timeout: Duration,
        grace_period: Duration,
    ) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            start_command,
            reload_command,
            reload_timeout,
            grace_period,
            state: Mutex::new(ProxyState::NotStarted),
            pid: Mutex::new(None),
            kill_tx: Mutex::new(None),
            stopping: AtomicBool::new(false),
            exit_tx,
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    /// Spawn the proxy in the foreground and start draining its output
    pub fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        {
            let state = self.state.lock();
            if *state != ProxyState::NotStarted {
                return Err(SupervisorError::AlreadyStarted);
            }
        }

        let command = self.start_command.display();
        info!(command = %command, "Starting proxy");

        let mut cmd = self.start_command.command();
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.clone(),
            source,
        })?;

        let pid = child.id();
        info!(pid, "Proxy process spawned");
        *self.pid.lock() = pid;
        *self.state.lock() = ProxyState::Running;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_drain(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_drain(stderr, "stderr");
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock() = Some(kill_tx);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let description = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };

            *supervisor.state.lock() = ProxyState::Dead;
            *supervisor.pid.lock() = None;

            if supervisor.stopping.load(Ordering::SeqCst) {
                info!(status = %description, "Proxy process exited");
            } else {
                error!(status = %description, "Proxy process exited unexpectedly");
            }
            let _ = supervisor.exit_tx.send(Some(description));
        });

        Ok(())
    }

    /// Resolves once the proxy process has exited, with its exit description
    pub async fn wait_for_exit(&self) -> String {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if let Some(description) = rx.borrow_and_update().clone() {
                return description;
            }
            if rx.changed().await.is_err() {
                return "supervisor dropped".to_string();
            }
        }
    }

    /// Stop the proxy: SIGTERM, then SIGKILL once the grace period runs out
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let Some(pid) = *self.pid.lock() else {
            return;
        };
        info!(pid, "Sending SIGTERM to proxy");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }

        match tokio::time::timeout(self.grace_period, self.wait_for_exit()).await {
            Ok(status) => info!(status = %status, "Proxy stopped"),
            Err(_) => {
                warn!(
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, killing proxy"
                );
                if let Some(kill_tx) = self.kill_tx.lock().take() {
                    let _ = kill_tx.send(());
                }
                self.wait_for_exit().await;
            }
        }
    }

    async fn run_reload(&self) -> Result<ReloadReport, SupervisorError> {
        let _guard = self.reload_lock.lock().await;

        let was_running = {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Dead => return Err(SupervisorError::NotRunning),
                ProxyState::Running => {
                    *state = ProxyState::Reloading;
                    true
                }
                _ => false,
            }
        };

        let result = self.execute_reload().await;

        if was_running {
            let mut state = self.state.lock();
            if *state == ProxyState::Reloading {
                *state = ProxyState::Running;
            }
        }

        match &result {
            Ok(report) => info!(
                duration_ms = report.duration.as_millis() as u64,
                "Proxy reloaded"
            ),
            Err(e) => warn!(error = %e, "Proxy reload failed"),
        }
        result
    }

    async fn execute_reload(&self) -> Result<ReloadReport, SupervisorError> {
        let command = self.reload_command.display();
        debug!(command = %command, "Reloading proxy");
        let started = Instant::now();

        let mut cmd = self.reload_command.command();
        // A timed-out reload is dropped, which must not leave it running
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(collect_lines(stdout, "stdout"), collect_lines(stderr, "stderr"));
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out.into_iter().chain(err).collect::<Vec<_>>()))
        };

        let (status, output) = match tokio::time::timeout(self.reload_timeout, run).await {
            Ok(result) => result?,
            Err(_) => return Err(SupervisorError::ReloadTimeout(self.reload_timeout)),
        };

        if !status.success() {
            return Err(SupervisorError::ReloadFailed {
                status: status.to_string(),
                output,
            });
        }
        if output
            .iter()
            .any(|line| FAILURE_MARKERS.iter().any(|m| line.contains(m)))
        {
            return Err(SupervisorError::ConfigRejected { output });
        }

        Ok(ReloadReport {
            output,
            duration: started.elapsed(),
        })
    }
}

impl Reloader for ProxySupervisor {
    fn reload(&self) -> BoxFuture<'_, Result<ReloadReport, SupervisorError>> {
        self.run_reload().boxed()
    }
}

/// Read one newline-terminated line, decoding invalid UTF-8 lossily.
///
/// Returns `Ok(None)` at end-of-stream. Only I/O errors end the read; the pipe
/// must stay open while the writer lives or the writer dies of SIGPIPE.
async fn read_line_lossy<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).trim_end().to_string()))
}

/// Stream a process output pipe onto the log until end-of-stream
fn spawn_log_drain<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            match read_line_lossy(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if stream == "stderr" {
                        warn!(target: "proxy", stream, "{}", line);
                    } else {
                        info!(target: "proxy", stream, "{}", line);
                    }
                }
                Ok(None) => {
                    debug!(stream, "Proxy output stream closed");
                    break;
                }
                Err(e) => {
                    warn!(stream, error = %e, "Failed reading proxy output");
                    break;
                }
            }
        }
    });
}

/// Read a pipe to end-of-stream, logging and collecting each line
async fn collect_lines<R>(reader: Option<R>, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };

    let mut collected = Vec::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                info!(target: "proxy", stream, phase = "reload", "{}", line);
                collected.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "Failed reading reload output");
                break;
            }
        }
    }
    collected
}
