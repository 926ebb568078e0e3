//! Ephemeral agent containers, driven through the docker CLI.
//!
//! The container is created per attempt, its demultiplexed stdout/stderr
//! is streamed line by line, and it is force-removed afterwards no matter
//! how the attempt ended. Cleanup deliberately ignores the worker's
//! cancellation: an interrupted worker still removes its container.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the agent container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    /// The agent process exited with this status code.
    Exited(i32),
    /// The worker was cancelled and killed the container.
    Cancelled,
}

/// Fail fast when the agent image is not present locally. Missing images
/// are a deployment problem, not something to discover one task at a time.
pub async fn ensure_image(image: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .await
        .context("failed to run docker image inspect")?;

    if !output.status.success() {
        bail!("agent image {image:?} not found locally; pull or build it first");
    }
    Ok(())
}

/// Container name for a task attempt. Docker names allow alphanumerics,
/// hyphens, underscores and dots.
pub fn container_name(task_id: &str, attempt: i32) -> String {
    let sanitized: String = task_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("verve-{sanitized}-a{attempt}")
}

/// Run the agent container to completion, streaming every output line into
/// `lines`. Stdout and stderr are merged; ordering between the two streams
/// is best-effort, within each stream it is preserved.
pub async fn run_agent_container(
    image: &str,
    name: &str,
    env: &[(String, String)],
    extra_flags: &[String],
    lines: mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> Result<ContainerExit> {
    let mut args: Vec<String> = vec!["run".into(), "--name".into(), name.into()];
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.extend(extra_flags.iter().cloned());
    args.push(image.into());

    let mut child = Command::new("docker")
        .args(&args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn docker run")?;

    let stdout = child.stdout.take().context("docker run has no stdout")?;
    let stderr = child.stderr.take().context("docker run has no stderr")?;

    let out_task = tokio::spawn(forward_lines(stdout, lines.clone()));
    let err_task = tokio::spawn(forward_lines(stderr, lines));

    let exit = tokio::select! {
        status = child.wait() => {
            let status = status.context("failed to wait for docker run")?;
            ContainerExit::Exited(status.code().unwrap_or(-1))
        }
        _ = cancel.cancelled() => {
            debug!(container = name, "cancelling agent container");
            if let Err(e) = child.start_kill() {
                warn!(container = name, error = %e, "failed to kill docker run");
            }
            let _ = child.wait().await;
            ContainerExit::Cancelled
        }
    };

    // Drain whatever output is still buffered.
    let _ = out_task.await;
    let _ = err_task.await;

    Ok(exit)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "error reading container output");
                return;
            }
        }
    }
}

/// Force-remove the container. Uses no cancellation token on purpose and
/// tolerates the container already being gone.
pub async fn remove_container(name: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["rm", "-f", name])
        .output()
        .await
        .context("failed to run docker rm")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("No such container") {
            bail!("docker rm -f {name} failed: {stderr}");
        }
    }
    Ok(())
}
