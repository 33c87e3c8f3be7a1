//! Process liveness: capture and re-verify the (pid, command, start-time)
//! triple persisted with each apply.
//!
//! A cancel requester proves the driving process is still the one recorded
//! at dispatch before transitioning the row. Any discrepancy, including a
//! reused pid or a process whose information can no longer be read, counts
//! as not alive.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Identity of the process driving an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i64,
    pub command: String,
    pub started_at: String,
}

fn read_process(pid: u32) -> Option<(String, String)> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = system.process(pid)?;
    let command = process
        .cmd()
        .iter()
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("");
    Some((command, process.start_time().to_string()))
}

/// Capture the identity of the current process.
pub fn current() -> ProcessIdentity {
    let pid = std::process::id();
    let (command, started_at) = read_process(pid).unwrap_or_else(|| {
        // Reading our own process can fail on restricted systems; fall back
        // to the invocation arguments so the triple is still comparable.
        (std::env::args().collect::<Vec<_>>().join(""), "0".to_owned())
    });
    ProcessIdentity {
        pid: pid as i64,
        command,
        started_at,
    }
}

/// Whether the recorded triple still matches a live process.
pub fn is_alive(pid: i64, command: &str, started_at: &str) -> bool {
    let Ok(pid_u32) = u32::try_from(pid) else {
        return false;
    };
    match read_process(pid_u32) {
        Some((live_command, live_started_at)) => {
            live_command == command && live_started_at == started_at
        }
        None => false,
    }
}
