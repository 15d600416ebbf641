//! Helpers for domain processes: signals, reaping and identification.

#![allow(unsafe_code)]

use std::fs;
use std::thread;
use std::time::Duration;

use seclabel_common::{SeclabelError, SeclabelResult};

const ABORT_POLLS: u32 = 10;
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn to_pid(pid: u32) -> SeclabelResult<libc::pid_t> {
    libc::pid_t::try_from(pid).map_err(|_| SeclabelError::Internal {
        message: format!("pid {pid} out of range"),
    })
}

/// Describe a raw wait status.
#[must_use]
pub fn translate_status(status: i32) -> String {
    if libc::WIFEXITED(status) {
        format!("exit status {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("fatal signal {}", libc::WTERMSIG(status))
    } else {
        format!("invalid value {status}")
    }
}

/// Send `signal` to `pid`.
pub fn kill(pid: u32, signal: i32) -> SeclabelResult<()> {
    let raw = to_pid(pid)?;
    tracing::debug!(pid, signal, "Sending signal");

    // Safety: kill has no memory-safety preconditions.
    if unsafe { libc::kill(raw, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(SeclabelError::Internal {
            message: format!("Failed to send signal {signal} to {pid}: {err}"),
        });
    }

    Ok(())
}

fn waitpid(pid: libc::pid_t, flags: i32) -> SeclabelResult<Option<i32>> {
    let mut status: libc::c_int = 0;
    loop {
        // Safety: status points to a live c_int for the duration of the call.
        let result = unsafe { libc::waitpid(pid, &mut status, flags) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SeclabelError::Internal {
                message: format!("waitpid({pid}) failed: {err}"),
            });
        }
        return Ok((result != 0).then_some(status));
    }
}

/// Reap child `pid` and return its exit code.
///
/// A child killed by a signal reports `128 + signal`.
pub fn wait(pid: u32) -> SeclabelResult<i32> {
    let raw = to_pid(pid)?;
    let status = waitpid(raw, 0)?.unwrap_or_default();

    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        tracing::warn!(pid, status = %translate_status(status), "Unexpected wait status");
        1
    };

    tracing::debug!(pid, code, "Child reaped");
    Ok(code)
}

/// Terminate and reap child `pid`.
///
/// Sends SIGTERM, gives the child a short while to exit, then SIGKILL.
/// Failures are logged; the caller has nothing left to do with the child.
pub fn abort(pid: u32) {
    let Ok(raw) = to_pid(pid) else {
        tracing::warn!(pid, "Cannot abort child, pid out of range");
        return;
    };

    match waitpid(raw, libc::WNOHANG) {
        Ok(Some(status)) => {
            tracing::debug!(pid, status = %translate_status(status), "Child already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(pid, error = %e, "Cannot abort child");
            return;
        }
    }

    if let Err(e) = kill(pid, libc::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to terminate child");
    }

    for _ in 0..ABORT_POLLS {
        thread::sleep(ABORT_POLL_INTERVAL);
        match waitpid(raw, libc::WNOHANG) {
            Ok(Some(status)) => {
                tracing::debug!(pid, status = %translate_status(status), "Child terminated");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid, error = %e, "Failed to reap child");
                return;
            }
        }
    }

    tracing::debug!(pid, "Child ignored SIGTERM, killing");
    if let Err(e) = kill(pid, libc::SIGKILL) {
        tracing::warn!(pid, error = %e, "Failed to kill child");
    }
    match waitpid(raw, 0) {
        Ok(status) => {
            tracing::debug!(pid, status = ?status.map(translate_status), "Child killed");
        }
        Err(e) => tracing::warn!(pid, error = %e, "Failed to reap child"),
    }
}

/// Start time of `pid` in clock ticks since boot.
///
/// Together with the pid this identifies a process across pid reuse.
pub fn start_time(pid: u32) -> SeclabelResult<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    parse_start_time(&stat).ok_or_else(|| SeclabelError::Internal {
        message: format!("malformed /proc/{pid}/stat"),
    })
}

// The command name is parenthesised and may contain spaces, so fields are
// counted from the last ')', which is followed by field 3.
fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}
