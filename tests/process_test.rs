//! Integration tests for the llama-server supervisor
//!
//! A shell script stands in for the server binary. When a test needs the
//! server to look healthy, an axum router answers `/health` on the port the
//! script was told to use.
#![cfg(unix)]

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{routing::get, Json, Router};
use llama_launch::{with_server, Error, Result, ServerConfig, ServerHandle};
use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

struct Fixture {
    dir: TempDir,
    model: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        fs::write(&model, b"GGUF").unwrap();
        Self { dir, model }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes an executable `sh` script and returns its path.
    fn script(&self, body: &str) -> String {
        let path = self.path("llama-server");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn config(&self, binary: &str, port: u16) -> ServerConfig {
        ServerConfig::new(&self.model, 4096, 99)
            .with_port(u32::from(port))
            .with_binary(binary)
            .with_homebrew_path(false)
            .with_health_timeout(Duration::from_secs(10))
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Answers `/health` on a fresh port and returns that port.
async fn healthy_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = Router::new().route("/health", get(|| async { Json(json!({"status": "ok"})) }));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // an unreaped zombie still accepts signal 0
    if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some((_, rest)) = stat.rsplit_once(')') {
            if rest.trim_start().starts_with('Z') {
                return false;
            }
        }
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Whether `line` was logged under the server output target.
    fn relayed(&self, line: &str) -> bool {
        self.text()
            .lines()
            .any(|l| l.contains("llama_server:") && l.ends_with(line))
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

async fn wait_for(what: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(3) {
        if what() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn invalid_config_is_rejected_before_spawn() {
    let fx = Fixture::new();
    let marker = fx.path("spawned");
    let binary = fx.script(&format!("touch '{}'\nexec sleep 30", marker.display()));
    let base = fx.config(&binary, free_port());

    let cases = [
        ("n_ctx", ServerConfig { n_ctx: 0, ..base.clone() }),
        ("n_gpu_layers", ServerConfig { n_gpu_layers: 0, ..base.clone() }),
        ("port", base.clone().with_port(0)),
        ("port", base.clone().with_port(70000)),
        ("threads", base.clone().with_threads(0)),
        ("http_threads", base.clone().with_http_threads(0)),
        ("slots", base.clone().with_slots(0)),
        ("model_path", ServerConfig { model_path: PathBuf::new(), ..base.clone() }),
        ("model_path", ServerConfig { model_path: fx.path("missing.gguf"), ..base.clone() }),
        ("extra_args", base.clone().with_extra_args(["--jinja", ""])),
        ("environment", base.clone().with_env("BAD=KEY", "x")),
    ];

    for (field, config) in cases {
        let err = ServerHandle::start(config).await.unwrap_err();
        match &err {
            Error::Config(message) => {
                assert!(message.contains(field), "{field}: {message}")
            }
            other => panic!("{field}: expected Config error, got {other:?}"),
        }
    }
    assert!(!marker.exists(), "a process was spawned for an invalid config");
}

#[tokio::test]
async fn missing_binary_is_a_launch_error() {
    let fx = Fixture::new();
    let config = fx.config("llama-server-that-does-not-exist", free_port());

    let err = ServerHandle::start(config).await.unwrap_err();
    assert!(matches!(err, Error::Launch { .. }), "{err:?}");
    assert!(err.to_string().contains("not found in PATH"), "{err}");
}

#[tokio::test]
async fn early_exit_reports_captured_output() {
    let fx = Fixture::new();
    let binary = fx.script(
        "echo 'llama_model_load: error loading model: corrupted file'\n\
         echo 'main: exiting due to model loading error' >&2\n\
         exit 3",
    );

    let err = ServerHandle::start(fx.config(&binary, free_port()))
        .await
        .unwrap_err();
    match err {
        Error::Launch { message, output } => {
            assert!(message.contains("exited early"), "{message}");
            assert!(output.contains("corrupted file"), "{output}");
            assert!(output.contains("exiting due to model loading error"), "{output}");
        }
        other => panic!("expected Launch error, got {other:?}"),
    }
}

#[tokio::test]
async fn health_timeout_kills_the_process() {
    let fx = Fixture::new();
    let pid_file = fx.path("pid");
    let binary = fx.script(&format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()));
    let config = fx
        .config(&binary, free_port())
        .with_health_timeout(Duration::from_millis(800));

    let start = Instant::now();
    let err = ServerHandle::start(config).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(10));

    let pid = read_pid(&pid_file).expect("script wrote its pid");
    assert!(wait_for(|| !process_exists(pid)).await, "process {pid} survived");
}

#[tokio::test]
async fn start_passes_arguments_and_environment() -> Result<()> {
    let fx = Fixture::new();
    let args_file = fx.path("args");
    let env_file = fx.path("env");
    let binary = fx.script(&format!(
        "printf '%s\\n' \"$@\" > '{}'\necho \"$LLAMA_LAUNCH_MARK\" > '{}'\nexec sleep 30",
        args_file.display(),
        env_file.display()
    ));
    let port = healthy_port().await;
    let config = fx
        .config(&binary, port)
        .with_slots(2)
        .with_extra_args(["--jinja"])
        .with_env("LLAMA_LAUNCH_MARK", "from-test");

    let mut server = ServerHandle::start(config).await?;
    assert!(server.is_alive());
    assert_eq!(server.port(), port);
    assert_eq!(server.base_url(), format!("http://127.0.0.1:{}/v1", port));

    assert!(wait_for(|| env_file.exists()).await);
    let args: Vec<String> = fs::read_to_string(&args_file)?
        .lines()
        .map(str::to_string)
        .collect();
    let port_arg = port.to_string();
    let expected = [
        "-m",
        fx.model.to_str().unwrap(),
        "-c",
        "4096",
        "-ngl",
        "99",
        "--port",
        port_arg.as_str(),
        "--host",
        "127.0.0.1",
        "--slots",
        "2",
        "--jinja",
    ];
    assert_eq!(args, expected);
    assert!(
        wait_for(|| {
            fs::read_to_string(&env_file)
                .map(|s| s.trim() == "from-test")
                .unwrap_or(false)
        })
        .await
    );

    server.terminate(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn terminate_is_idempotent() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("exec sleep 30");
    let port = healthy_port().await;

    let mut server = ServerHandle::start(fx.config(&binary, port)).await?;
    let pid = server.pid().expect("running child has a pid");
    assert!(server.is_alive());

    server.terminate(Duration::from_secs(5)).await?;
    assert!(!server.is_alive());
    assert!(!process_exists(pid));

    server.terminate(Duration::from_secs(5)).await?;
    assert!(!server.is_alive());
    server.kill().await?;
    assert!(!server.is_alive());
    assert!(server.wait().await?.code().is_none());
    Ok(())
}

#[tokio::test]
async fn terminate_escalates_to_kill() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("trap '' TERM\nwhile true; do sleep 1; done");
    let port = healthy_port().await;

    let mut server = ServerHandle::start(fx.config(&binary, port)).await?;
    let start = Instant::now();
    server.terminate(Duration::from_millis(500)).await?;
    assert!(!server.is_alive());
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn startup_output_is_kept_in_tail() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("echo 'main: server is listening'\nexec sleep 30");
    let port = healthy_port().await;

    let mut server = ServerHandle::start(fx.config(&binary, port)).await?;
    assert!(
        wait_for(|| server.tail().iter().any(|l| l.contains("server is listening"))).await,
        "tail: {:?}",
        server.tail()
    );
    server.kill().await?;
    Ok(())
}

#[tokio::test]
async fn with_server_terminates_after_body() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("exec sleep 30");
    let port = healthy_port().await;

    let pid = with_server(fx.config(&binary, port), |server| {
        Box::pin(async move {
            assert!(server.is_alive());
            Ok(server.pid().expect("running child has a pid"))
        })
    })
    .await?;
    assert!(!process_exists(pid));
    Ok(())
}

#[tokio::test]
async fn with_server_terminates_when_body_fails() {
    let fx = Fixture::new();
    let pid_file = fx.path("pid");
    let binary = fx.script(&format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()));
    let port = healthy_port().await;

    let written = pid_file.clone();
    let result: Result<()> = with_server(fx.config(&binary, port), |_server| {
        Box::pin(async move {
            assert!(wait_for(|| read_pid(&written).is_some()).await);
            Err(Error::Decode("body failed".to_string()))
        })
    })
    .await;

    match result {
        Err(Error::Decode(message)) => assert_eq!(message, "body failed"),
        other => panic!("expected the body's error, got {other:?}"),
    }
    let pid = read_pid(&pid_file).unwrap();
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn output_is_relayed_only_when_streaming_logs() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("echo 'slot 0: prompt done'\nexec sleep 30");
    let port = healthy_port().await;
    let base = fx.config(&binary, port);

    let cases = [
        ("default", base.clone(), true),
        ("stream_logs off", base.clone().with_stream_logs(false), false),
        ("log_disable", base.clone().with_log_disable(true), false),
    ];
    for (name, config, relayed) in cases {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut server = ServerHandle::start(config).await?;
        assert!(
            wait_for(|| server.tail().iter().any(|l| l == "slot 0: prompt done")).await,
            "{name}: tail {:?}",
            server.tail()
        );
        assert_eq!(
            capture.relayed("slot 0: prompt done"),
            relayed,
            "{name}:\n{}",
            capture.text()
        );
        server.kill().await?;
    }
    Ok(())
}

#[tokio::test]
async fn tail_keeps_the_last_lines() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script(
        "i=0\nwhile [ $i -lt 500 ]; do echo line-$i; i=$((i+1)); done\nexec sleep 30",
    );
    let port = healthy_port().await;
    let config = fx.config(&binary, port).with_stream_logs(false);

    let mut server = ServerHandle::start(config).await?;
    assert!(
        wait_for(|| server.tail().last().map(String::as_str) == Some("line-499")).await,
        "tail: {:?}",
        server.tail().last()
    );
    let tail = server.tail();
    assert_eq!(tail.len(), 200);
    assert_eq!(tail[0], "line-300");
    server.kill().await?;
    Ok(())
}

#[tokio::test]
async fn dropping_a_live_handle_stops_the_server() -> Result<()> {
    let fx = Fixture::new();
    let binary = fx.script("exec sleep 30");
    let port = healthy_port().await;

    let server = ServerHandle::start(fx.config(&binary, port)).await?;
    let pid = server.pid().expect("running child has a pid");
    assert!(process_exists(pid));

    drop(server);
    assert!(wait_for(|| !process_exists(pid)).await, "process {pid} survived the drop");
    Ok(())
}
