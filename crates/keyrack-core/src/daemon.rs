//! Daemon status checking

use std::path::{Path, PathBuf};

/// Status of a daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running,
    Stopped,
    Error,
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Running => "●",
            Self::Stopped => "○",
            Self::Error => "●",
        }
    }
}

/// Information about a daemon
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub status: DaemonStatus,
    pub socket_path: Option<PathBuf>,
    pub pid: Option<u32>,
}

/// Check a daemon by its socket and pid file
pub fn check_daemon(socket_path: &Path, pid_file: &Path) -> DaemonInfo {
    let socket_exists = socket_path.exists();

    let pid = std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok());
    let process_running = pid.map(crate::process::is_alive).unwrap_or(false);

    let status = match (socket_exists, process_running) {
        (true, true) => DaemonStatus::Running,
        (true, false) => DaemonStatus::Error, // Socket exists but process dead
        (false, true) => DaemonStatus::Running, // Process up, socket still binding
        (false, false) => DaemonStatus::Stopped,
    };

    DaemonInfo {
        status,
        socket_path: if socket_exists {
            Some(socket_path.to_path_buf())
        } else {
            None
        },
        pid: if process_running { pid } else { None },
    }
}
