//! Process management utilities

use std::process::Command;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Check if the process with this pid is still alive
pub fn is_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pids = [Pid::from_u32(pid)];
    sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Get PIDs of processes whose command line contains every needle
pub fn find_pids(needles: &[&str]) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = std::process::id();
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter(|(_, p)| {
            let cmd: Vec<String> = p
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            needles
                .iter()
                .all(|needle| cmd.iter().any(|arg| arg.contains(needle)))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();

    // Fallback: use pgrep on Unix
    #[cfg(unix)]
    if pids.is_empty() {
        if let Ok(output) = Command::new("pgrep").args(["-f", &needles.join(" ")]).output() {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines() {
                    if let Ok(pid) = line.trim().parse::<u32>() {
                        if pid != own_pid {
                            pids.push(pid);
                        }
                    }
                }
            }
        }
    }

    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_find_pids_excludes_self() {
        let pids = find_pids(&["keyrack-core-no-such-process-marker"]);
        assert!(!pids.contains(&std::process::id()));
    }
}
