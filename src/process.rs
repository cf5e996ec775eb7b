//! Build execution: launch BitBake inside a container and forward its
//! stdout/stderr to the Log Fan-out line-by-line.
//!
//! Spawns via `tokio::process::Command`, with two `BufReader::lines()`
//! tasks reading stdout/stderr and forwarding into the log channel,
//! `tokio::join!` draining both before returning, and cooperative
//! cancellation via `CancellationToken`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::logfanout::LogFanout;
use crate::model::LogStream;

/// How long a canceled subprocess gets to exit on its own before being
/// force-killed.
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct ExecutionRequest {
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub workspace_dir: String,
    pub deploy_dir: String,
    pub downloads_dir: String,
    pub sstate_dir: String,
    pub layer_dirs: Vec<String>,
    pub env: HashMap<String, String>,
    pub fanout: Arc<LogFanout>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Exited(i32),
    Canceled,
}

/// Opaque process executor. `process.rs` owns only the *shape* of the
/// interface; the concrete container tooling is not this daemon's concern.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionOutcome, String>;
}

/// Runs BitBake for real, via a system container CLI invocation.
pub struct SystemContainerEngine;

#[async_trait]
impl ContainerEngine for SystemContainerEngine {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionOutcome, String> {
        let mut cmd = Command::new("container-engine");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name").arg(&req.container_name)
            .arg("-v").arg(format!("{}:/workspace", req.workspace_dir))
            .arg("-v").arg(format!("{}:/deploy", req.deploy_dir))
            .arg("-v").arg(format!("{}:/downloads", req.downloads_dir))
            .arg("-v").arg(format!("{}:/sstate", req.sstate_dir));
        for layer in &req.layer_dirs {
            cmd.arg("-v").arg(format!("{layer}:/layers/{}", layer_name(layer)));
        }
        cmd.arg(&req.image).args(&req.command).envs(&req.env).stdout(Stdio::piped()).stderr(Stdio::piped());

        run_and_stream(cmd, req.fanout, req.cancel).await
    }
}

fn layer_name(path: &str) -> String {
    std::path::Path::new(path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// Smoke-mode engine honoring the `SMIDR_TEST_*` contract: substitutes a
/// trivial entrypoint and writes marker files instead of invoking
/// BitBake, while preserving all state-machine and I/O behavior the real
/// engine would exhibit.
pub struct SmokeContainerEngine;

#[async_trait]
impl ContainerEngine for SmokeContainerEngine {
    async fn run(&self, req: ExecutionRequest) -> Result<ExecutionOutcome, String> {
        let entrypoint = std::env::var("SMIDR_TEST_ENTRYPOINT").unwrap_or_else(|_| "sh,-c,echo smoke build ok".to_string());
        let parts: Vec<String> = entrypoint.split(',').map(str::to_string).collect();
        let (program, args) = parts.split_first().ok_or_else(|| "SMIDR_TEST_ENTRYPOINT is empty".to_string())?;

        let marker_dir = std::path::PathBuf::from(&req.deploy_dir);
        std::fs::create_dir_all(&marker_dir).map_err(|e| e.to_string())?;
        std::fs::write(marker_dir.join("smoke-marker.txt"), b"smoke mode artifact\n").map_err(|e| e.to_string())?;

        let mut cmd = Command::new(program);
        cmd.args(args).envs(&req.env).stdout(Stdio::piped()).stderr(Stdio::piped());

        run_and_stream(cmd, req.fanout, req.cancel).await
    }
}

/// Returns true when the daemon should use `SmokeContainerEngine` for
/// this build (`SMIDR_TEST_WRITE_MARKERS=1`).
pub fn smoke_mode_enabled() -> bool {
    std::env::var("SMIDR_TEST_WRITE_MARKERS").as_deref() == Ok("1")
}

async fn run_and_stream(
    mut cmd: Command,
    fanout: Arc<LogFanout>,
    cancel: CancellationToken,
) -> Result<ExecutionOutcome, String> {
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| format!("failed to spawn build process: {e}"))?;

    let stdout = child.stdout.take().ok_or("failed to capture stdout")?;
    let stderr = child.stderr.take().ok_or("failed to capture stderr")?;

    let stdout_task = {
        let fanout = fanout.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                fanout.write(LogStream::Stdout, &line, chrono::Utc::now().timestamp());
            }
        })
    };
    let stderr_task = {
        let fanout = fanout.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                fanout.write(LogStream::Stderr, &line, chrono::Utc::now().timestamp());
            }
        })
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(CANCEL_GRACE_PERIOD, child.wait()).await;
            let _ = child.start_kill();
            let _ = tokio::join!(stdout_task, stderr_task);
            Ok(ExecutionOutcome::Canceled)
        }
        status = child.wait() => {
            let status = status.map_err(|e| e.to_string())?;
            let _ = tokio::join!(stdout_task, stderr_task);
            Ok(ExecutionOutcome::Exited(status.code().unwrap_or(-1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn smoke_engine_writes_marker_and_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let fanout = Arc::new(LogFanout::create(dir.path()).unwrap());
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();

        std::env::set_var("SMIDR_TEST_ENTRYPOINT", "sh,-c,echo hello");
        let req = ExecutionRequest {
            container_name: "smidr-test".into(),
            image: "n/a".into(),
            command: vec![],
            workspace_dir: workspace.to_string_lossy().to_string(),
            deploy_dir: dir.path().join("deploy").to_string_lossy().to_string(),
            downloads_dir: "/tmp".into(),
            sstate_dir: "/tmp".into(),
            layer_dirs: vec![],
            env: HashMap::new(),
            fanout: fanout.clone(),
            cancel: CancellationToken::new(),
        };

        let outcome = SmokeContainerEngine.run(req).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Exited(0)));
        assert!(dir.path().join("deploy").join("smoke-marker.txt").exists());
        std::env::remove_var("SMIDR_TEST_ENTRYPOINT");
    }

    #[tokio::test]
    async fn cancel_during_run_force_kills_and_reports_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let fanout = Arc::new(LogFanout::create(dir.path()).unwrap());
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();

        std::env::set_var("SMIDR_TEST_ENTRYPOINT", "sh,-c,sleep 60");
        let cancel = CancellationToken::new();
        let req = ExecutionRequest {
            container_name: "smidr-test".into(),
            image: "n/a".into(),
            command: vec![],
            workspace_dir: workspace.to_string_lossy().to_string(),
            deploy_dir: dir.path().join("deploy").to_string_lossy().to_string(),
            downloads_dir: "/tmp".into(),
            sstate_dir: "/tmp".into(),
            layer_dirs: vec![],
            env: HashMap::new(),
            fanout: fanout.clone(),
            cancel: cancel.clone(),
        };

        let run = tokio::spawn(async move { SmokeContainerEngine.run(req).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Canceled));
        std::env::remove_var("SMIDR_TEST_ENTRYPOINT");
    }
}
