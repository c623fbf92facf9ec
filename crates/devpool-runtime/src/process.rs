//! Host process queries
//!
//! Liveness uses `kill(pid, 0)`: no signal is delivered, only the existence
//! and permission checks run.

use devpool_core::{EnvId, Pid};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{self, User};
use tracing::{debug, warn};

use crate::traits::ProcessLiveness;

/// Liveness backed by the host process table
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcesses;

impl ProcessLiveness for HostProcesses {
    fn is_alive(&self, pid: Pid) -> bool {
        // 0 and values past i32::MAX would address process groups
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return false,
        };

        match kill(unistd::Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to another user
            Err(Errno::EPERM) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid = pid, error = %e, "Unexpected liveness check failure");
                false
            }
        }
    }
}

/// The user running the current invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub name: String,
}

pub fn current_owner() -> Owner {
    let uid = unistd::getuid();
    let name = match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        Ok(None) => uid.to_string(),
        Err(e) => {
            debug!(uid = uid.as_raw(), error = %e, "passwd lookup failed");
            uid.to_string()
        }
    };

    Owner {
        uid: uid.as_raw(),
        name,
    }
}

/// The process an invocation acts for by default: the shell that started it
pub fn default_process_id() -> Pid {
    unistd::getppid().as_raw() as Pid
}

/// The environment a process joins by default: its session id
pub fn default_environment_id(pid: Pid) -> EnvId {
    let target = i32::try_from(pid).ok().map(unistd::Pid::from_raw);
    match unistd::getsid(target) {
        Ok(sid) => sid.as_raw() as EnvId,
        Err(e) => {
            debug!(pid = pid, error = %e, "getsid failed, using the pid as environment id");
            pid as EnvId
        }
    }
}
