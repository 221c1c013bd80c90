//! Orphan Worker Scanning
//!
//! Best-effort recovery for workers whose handle was lost with a previous
//! server instance. Matching is heuristic: a process counts as a worker only
//! when its command line carries the marker argument and its executable is
//! the configured program. Anything else launched with the same marker and
//! program will be matched too.

use crate::SupervisorError;
use std::path::Path;
use sysinfo::System;
use tracing::debug;

/// How a worker process is recognized in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSignature {
    /// Executable name, without directories
    pub program: String,
    /// Argument every worker is launched with
    pub marker: String,
}

impl WorkerSignature {
    pub fn new(program: &str, marker: &str) -> Self {
        Self {
            program: file_name(program).to_string(),
            marker: marker.to_string(),
        }
    }

    /// Does a process with this name and command line look like a worker?
    pub fn matches(&self, name: &str, cmd: &[String]) -> bool {
        if self.marker.is_empty() || !cmd.iter().any(|arg| arg == &self.marker) {
            return false;
        }
        name == self.program
            || cmd
                .first()
                .map(|argv0| file_name(argv0) == self.program)
                .unwrap_or(false)
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Process table access used for orphan recovery
pub trait ProcessScanner: Send + Sync + 'static {
    /// Pids of live processes matching `signature`, excluding this process
    fn find_workers(&self, signature: &WorkerSignature) -> Result<Vec<u32>, SupervisorError>;

    /// Kill `pid` outright
    fn kill(&self, pid: u32) -> Result<(), SupervisorError>;
}

/// Scanner over the OS process table
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoScanner;

impl ProcessScanner for SysinfoScanner {
    fn find_workers(&self, signature: &WorkerSignature) -> Result<Vec<u32>, SupervisorError> {
        let mut system = System::new();
        system.refresh_processes();

        let own_pid = std::process::id();
        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process))
            .filter(|(pid, _)| *pid != own_pid)
            .filter(|(_, process)| signature.matches(process.name(), process.cmd()))
            .map(|(pid, _)| pid)
            .collect();
        pids.sort_unstable();
        pids.dedup();

        debug!(
            "Process scan for '{}' with marker '{}': {} match(es)",
            signature.program,
            signature.marker,
            pids.len()
        );
        Ok(pids)
    }

    fn kill(&self, pid: u32) -> Result<(), SupervisorError> {
        #[cfg(unix)]
        {
            match send_signal(pid, libc::SIGKILL) {
                Ok(()) => Ok(()),
                // Already gone
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
                Err(e) => Err(SupervisorError::ForceKill {
                    pid,
                    reason: e.to_string(),
                }),
            }
        }
        #[cfg(not(unix))]
        {
            let mut system = System::new();
            system.refresh_processes();
            match system.process(sysinfo::Pid::from_u32(pid)) {
                Some(process) if !process.kill() => Err(SupervisorError::ForceKill {
                    pid,
                    reason: "kill request rejected".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }
}

/// Send `signal` to `pid`
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_signature_requires_marker() {
        let signature = WorkerSignature::new("/usr/bin/python3", "--acquisition-worker");
        assert_eq!(signature.program, "python3");

        assert!(signature.matches("python3", &cmd(&["python3", "obddata.py", "4", "--acquisition-worker"])));
        assert!(!signature.matches("python3", &cmd(&["python3", "obddata.py", "4"])));
        assert!(!signature.matches("python3", &cmd(&["python3", "--acquisition-worker-x"])));
    }

    #[test]
    fn test_signature_requires_program() {
        let signature = WorkerSignature::new("python3", "--acquisition-worker");

        // Truncated process names still match on argv[0]
        assert!(signature.matches("python3.11", &cmd(&["/usr/bin/python3", "w.py", "--acquisition-worker"])));
        assert!(!signature.matches("vim", &cmd(&["vim", "--acquisition-worker"])));
    }

    #[test]
    fn test_empty_marker_never_matches() {
        let signature = WorkerSignature::new("sh", "");
        assert!(!signature.matches("sh", &cmd(&["sh", ""])));
    }

    #[test]
    fn test_scan_without_workers() {
        let signature = WorkerSignature::new("sh", "--marker-that-no-process-has-7f3a");
        assert!(SysinfoScanner.find_workers(&signature).unwrap().is_empty());
    }
}
