//! Process liveness probing.
//!
//! Answers "is this pid still running" with a single zero-effect
//! `kill(pid, 0)` probe of the process table. ESRCH means the process is
//! gone; any other failure is surfaced as an error, because reclamation
//! must not guess whether a partition is still in use.

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("liveness probe for pid {pid} failed with errno {errno}")]
    Probe { pid: u32, errno: i32 },
}

/// Oracle answering whether a process is currently running on this host.
pub trait Liveness {
    /// One authoritative probe per call; no retries.
    fn is_alive(&self, pid: u32) -> Result<bool, OracleError>;
}

/// `kill(pid, 0)`-backed probe of the host process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillProbe;

impl Liveness for KillProbe {
    fn is_alive(&self, pid: u32) -> Result<bool, OracleError> {
        // pid 0 would signal the whole process group, and pids above
        // i32::MAX wrap negative in pid_t; neither names a real process.
        if pid == 0 || pid > i32::MAX as u32 {
            return Ok(false);
        }

        // Signal 0 delivers nothing; this only asks the kernel whether
        // the pid exists.
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if ret == 0 {
            return Ok(true);
        }

        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::ESRCH {
            Ok(false)
        } else {
            Err(OracleError::Probe { pid, errno })
        }
    }
}

/// Pid of the parent process, the default owner identity.
///
/// The allocator runs as a short-lived helper spawned by the real
/// client, so its own pid is useless for claim deduplication.
pub fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

/// Fixed set of live pids, for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticLiveness {
    live: BTreeSet<u32>,
}

impl StaticLiveness {
    pub fn new<I: IntoIterator<Item = u32>>(live: I) -> Self {
        Self {
            live: live.into_iter().collect(),
        }
    }
}

impl Liveness for StaticLiveness {
    fn is_alive(&self, pid: u32) -> Result<bool, OracleError> {
        Ok(self.live.contains(&pid))
    }
}
