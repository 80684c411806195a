use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

use crate::binary::{BinaryLocator, DEFAULT_BINARY};
use crate::error::{Error, Result};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const WAITING_LOG_INTERVAL: Duration = Duration::from_secs(10);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const FAILED_START_GRACE: Duration = Duration::from_secs(5);
const TAIL_LINES: usize = 200;

pub const DEFAULT_PORT: u32 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to launch one `llama-server` instance.
///
/// Numeric options are unsigned but still validated: zero is rejected, and so
/// is a port above 65535.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub model_path: PathBuf,
    pub n_ctx: u32,
    pub n_gpu_layers: u32,
    pub port: u32,
    pub host: String,
    pub threads: Option<u32>,
    pub http_threads: Option<u32>,
    pub slots: Option<u32>,
    pub cors: Option<String>,
    pub log_disable: bool,
    /// `Some(false)` passes `--log-colors=0`; `None` leaves the server default.
    pub log_colors: Option<bool>,
    pub verbose: bool,
    pub api_key: Option<String>,
    pub extra_args: Vec<String>,
    /// Extra environment for the child only.
    pub env: Vec<(String, String)>,
    pub stream_logs: bool,
    pub health_timeout: Duration,
    pub ensure_homebrew_path: bool,
    pub binary: String,
}

impl ServerConfig {
    pub fn new(model_path: impl Into<PathBuf>, n_ctx: u32, n_gpu_layers: u32) -> Self {
        Self {
            model_path: model_path.into(),
            n_ctx,
            n_gpu_layers,
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            threads: None,
            http_threads: None,
            slots: None,
            cors: None,
            log_disable: false,
            log_colors: None,
            verbose: false,
            api_key: None,
            extra_args: Vec::new(),
            env: Vec::new(),
            stream_logs: true,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            ensure_homebrew_path: true,
            binary: DEFAULT_BINARY.to_string(),
        }
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_http_threads(mut self, http_threads: u32) -> Self {
        self.http_threads = Some(http_threads);
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = Some(slots);
        self
    }

    pub fn with_cors(mut self, origin: impl Into<String>) -> Self {
        self.cors = Some(origin.into());
        self
    }

    pub fn with_log_disable(mut self, log_disable: bool) -> Self {
        self.log_disable = log_disable;
        self
    }

    pub fn with_log_colors(mut self, log_colors: bool) -> Self {
        self.log_colors = Some(log_colors);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stream_logs(mut self, stream_logs: bool) -> Self {
        self.stream_logs = stream_logs;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_homebrew_path(mut self, ensure: bool) -> Self {
        self.ensure_homebrew_path = ensure;
        self
    }

    /// Overrides the executable name or path (defaults to `llama-server`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Checks everything that can be checked without spawning anything.
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(Error::config("model_path must be a non-empty path"));
        }
        if !self.model_path.exists() {
            return Err(Error::config(format!(
                "model_path does not exist: {}",
                self.model_path.display()
            )));
        }
        for (name, value) in [
            ("n_ctx", self.n_ctx),
            ("n_gpu_layers", self.n_gpu_layers),
            ("port", self.port),
        ] {
            if value == 0 {
                return Err(Error::config(format!(
                    "{name} must be a positive integer (got {value})"
                )));
            }
        }
        self.port_u16()?;
        for (name, value) in [
            ("threads", self.threads),
            ("http_threads", self.http_threads),
            ("slots", self.slots),
        ] {
            if value == Some(0) {
                return Err(Error::config(format!(
                    "{name} must be a positive integer if provided (got 0)"
                )));
            }
        }
        if let Some(pos) = self.extra_args.iter().position(|arg| arg.is_empty()) {
            return Err(Error::config(format!("extra_args[{pos}] is empty")));
        }
        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::config(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }
        if self.binary.is_empty() {
            return Err(Error::config("binary must be non-empty"));
        }
        Ok(())
    }

    /// Command-line arguments for the server, excluding the binary itself.
    pub fn build_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            self.model_path.clone().into_os_string(),
            "-c".into(),
            self.n_ctx.to_string().into(),
            "-ngl".into(),
            self.n_gpu_layers.to_string().into(),
            "--port".into(),
            self.port.to_string().into(),
            "--host".into(),
            self.host.clone().into(),
        ];
        let mut flag = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(name.into());
                args.push(value.into());
            }
        };
        flag("-t", self.threads.map(|n| n.to_string()));
        flag("--threads-http", self.http_threads.map(|n| n.to_string()));
        flag("--slots", self.slots.map(|n| n.to_string()));
        flag("--cors", self.cors.clone().filter(|c| !c.is_empty()));

        if self.log_disable {
            args.push("--log-disable".into());
        }
        if self.log_colors == Some(false) {
            args.push("--log-colors=0".into());
        }
        if self.verbose {
            args.push("-v".into());
        }
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            args.push("--api-key".into());
            args.push(key.into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    fn port_u16(&self) -> Result<u16> {
        u16::try_from(self.port)
            .map_err(|_| Error::config(format!("port must be <= 65535 (got {})", self.port)))
    }

    pub(crate) fn health_url(&self) -> String {
        format!("http://{}:{}/health", connect_host(&self.host), self.port)
    }
}

/// Wildcard bind addresses are not connectable; poll them over loopback.
fn connect_host(host: &str) -> String {
    match host {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{h}]"),
        h => h.to_string(),
    }
}

#[derive(Debug, Default)]
struct OutputState {
    tail: VecDeque<String>,
    relay: bool,
}

/// Drains the child's merged stdout/stderr, keeps a bounded tail, and relays
/// lines to the log once switched on.
struct OutputRelay {
    state: Arc<Mutex<OutputState>>,
    task: JoinHandle<()>,
}

impl OutputRelay {
    fn spawn(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        let state = Arc::new(Mutex::new(OutputState::default()));
        let lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .merge(SplitStream::new(BufReader::new(stderr).split(b'\n')));

        let worker_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            tokio::pin!(lines);
            while let Some(segment) = lines.next().await {
                let bytes = match segment {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::debug!(error = %e, "Stopped reading llama-server output");
                        break;
                    }
                };
                let line = String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\r')
                    .to_string();

                let mut state = worker_state.lock().unwrap_or_else(|e| e.into_inner());
                if state.relay {
                    tracing::info!(target: "llama_server", "{}", line);
                }
                if state.tail.len() == TAIL_LINES {
                    state.tail.pop_front();
                }
                state.tail.push_back(line);
            }
        });

        Self { state, task }
    }

    /// Replays what was captured during startup, then relays live lines.
    fn start_relay(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for line in &state.tail {
            tracing::info!(target: "llama_server", "{}", line);
        }
        state.relay = true;
    }

    /// Gives the worker a moment to read what a dead child left in the pipes.
    async fn drain(&mut self, timeout: Duration) {
        if self.task.is_finished() {
            return;
        }
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            tracing::debug!("llama-server output still open after exit");
        }
    }

    fn tail(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tail.iter().cloned().collect()
    }

    fn tail_text(&self) -> String {
        let tail = self.tail();
        if tail.is_empty() {
            "(no output)".to_string()
        } else {
            tail.join("\n")
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// A running `llama-server` child in its own process group.
///
/// Dropping a handle whose process is still alive sends SIGTERM to the
/// group; use [`ServerHandle::terminate`] to also wait for the exit.
pub struct ServerHandle {
    child: Child,
    pid: Option<u32>,
    host: String,
    port: u16,
    output: OutputRelay,
    exit_status: Option<ExitStatus>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("pid", &self.pid)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("output", &"<JoinHandle>")
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

impl ServerHandle {
    /// Validates `config`, spawns the server and waits until `/health`
    /// answers with success.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let port = config.port_u16()?;

        let locator = BinaryLocator::from_env(config.ensure_homebrew_path);
        let binary = locator.locate(&config.binary)?;

        tracing::info!(
            binary = %binary.display(),
            model = %config.model_path.display(),
            port,
            "Starting llama-server"
        );

        let mut command = Command::new(&binary);
        command
            .args(config.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !locator.search_path().is_empty() {
            command.env("PATH", locator.search_path());
        }
        command.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            Error::launch(format!("failed to spawn {}: {}", binary.display(), e), "(not started)")
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::launch("failed to capture stdout", "(not started)"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::launch("failed to capture stderr", "(not started)"))?;

        let mut handle = Self {
            pid: child.id(),
            child,
            host: config.host.clone(),
            port,
            output: OutputRelay::spawn(stdout, stderr),
            exit_status: None,
        };

        if let Err(err) = handle
            .wait_for_health(&config.health_url(), config.health_timeout)
            .await
        {
            if let Err(e) = handle.terminate(FAILED_START_GRACE).await {
                tracing::warn!(error = %e, "Failed to stop llama-server after failed start");
            }
            return Err(err);
        }

        if config.stream_logs && !config.log_disable {
            handle.output.start_relay();
        }
        Ok(handle)
    }

    async fn wait_for_health(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let http = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()?;

        let start = Instant::now();
        let mut last_report = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.child.try_wait()? {
                self.exit_status = Some(status);
                self.output.drain(OUTPUT_DRAIN_TIMEOUT).await;
                tracing::error!(%status, "llama-server exited before reporting healthy");
                return Err(Error::launch(
                    format!("llama-server exited early ({status}) before reporting healthy"),
                    self.output.tail_text(),
                ));
            }

            match http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(
                        port = self.port,
                        "llama-server healthy in {:?}",
                        start.elapsed()
                    );
                    return Ok(());
                }
                Ok(resp) => tracing::debug!(status = %resp.status(), "Health check not ready"),
                Err(e) => tracing::debug!(error = %e, "Health check failed"),
            }

            if last_report.elapsed() >= WAITING_LOG_INTERVAL {
                tracing::info!(port = self.port, "Waiting for llama-server to become healthy...");
                last_report = Instant::now();
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Err(Error::timeout(
            format!("llama-server health check on port {}", self.port),
            timeout,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// OpenAI-compatible base URL of this server, e.g. `http://127.0.0.1:8080/v1`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", connect_host(&self.host), self.port)
    }

    /// Last captured output lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.output.tail()
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Could not query llama-server status");
                false
            }
        }
    }

    /// SIGTERM to the process group, then SIGKILL if it has not exited
    /// within `timeout`. A no-op once the process has exited.
    pub async fn terminate(&mut self, timeout: Duration) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        tracing::info!(pid = ?self.pid, port = self.port, "Terminating llama-server");

        if let Err(e) = self.signal_group(GroupSignal::Terminate) {
            tracing::warn!(error = %e, "SIGTERM failed, killing llama-server");
            return self.kill().await;
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                tracing::info!(%status, "llama-server terminated");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Waiting for llama-server failed, killing it");
                self.kill().await
            }
            Err(_) => {
                tracing::warn!("llama-server did not exit within {:?}, killing it", timeout);
                self.kill().await
            }
        }
    }

    /// SIGKILL to the process group. A no-op once the process has exited.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.signal_group(GroupSignal::Kill) {
            tracing::warn!(error = %e, "Killing process group failed, killing child only");
            self.child.start_kill()?;
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        tracing::info!(%status, "llama-server killed");
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: GroupSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        // process_group(0) makes the child's pid its group id
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32))),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.exit_status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            tracing::debug!(pid = ?self.pid, "ServerHandle dropped while running, sending SIGTERM");
            if let Err(e) = self.signal_group(GroupSignal::Terminate) {
                tracing::warn!(error = %e, "Failed to signal llama-server on drop");
            }
        }
    }
}

/// Starts a server, runs `body` with it, and terminates it afterwards
/// whether `body` succeeded or not. The body's error wins over a
/// termination error.
///
/// ```no_run
/// use llama_launch::{with_server, LlamaClient, RequestOptions, ServerConfig};
///
/// # async fn demo() -> llama_launch::Result<()> {
/// let config = ServerConfig::new("/models/qwen3-8b-q4.gguf", 4096, 99);
/// let answer = with_server(config, |server| {
///     Box::pin(async move {
///         let client = LlamaClient::new(server.base_url());
///         client.send("Give one fun llama fact.", &RequestOptions::default()).await
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_server<T, F>(config: ServerConfig, body: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut ServerHandle) -> BoxFuture<'a, Result<T>>,
{
    let mut handle = ServerHandle::start(config).await?;
    let result = body(&mut handle).await;
    let stopped = handle.terminate(DEFAULT_TERMINATE_TIMEOUT).await;
    match (result, stopped) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(value), Ok(())) => Ok(value),
    }
}
