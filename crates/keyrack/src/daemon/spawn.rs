//! Lazy daemon startup

use crate::daemon::client::DaemonClient;
use crate::error::{KeyrackError, Result};
use keyrack_core::paths::SOCKET_ENV;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Start `keyrack daemon serve` in its own session unless one is answering.
///
/// Returns true when a daemon was spawned.
pub async fn ensure_running(client: &DaemonClient, log_file: &Path, wait: Duration) -> Result<bool> {
    if client.is_running().await {
        return Ok(false);
    }

    let exe = std::env::current_exe()?;
    if let Some(dir) = log_file.parent() {
        crate::atomic::ensure_private_dir(dir)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;

    let mut command = Command::new(exe);
    command
        .args(["daemon", "serve"])
        .env(SOCKET_ENV, client.socket_path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));

    // Detach from the caller's terminal session so the daemon outlives it
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let child = command.spawn()?;
    info!(pid = child.id(), "spawned daemon");

    let started = Instant::now();
    while started.elapsed() < wait {
        if client.is_running().await {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "daemon ready");
            return Ok(true);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(KeyrackError::DaemonUnavailable(format!(
        "daemon did not start within {}ms (see {})",
        wait.as_millis(),
        log_file.display()
    )))
}
