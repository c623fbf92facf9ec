//! Runtime trait definitions

use devpool_core::Pid;

/// Liveness predicate over process ids
///
/// Any `Fn(Pid) -> bool` is a predicate, so a targeted deactivation can pass
/// `|pid| pid != target` where a sweep passes [`crate::HostProcesses`].
pub trait ProcessLiveness {
    fn is_alive(&self, pid: Pid) -> bool;
}

impl<F> ProcessLiveness for F
where
    F: Fn(Pid) -> bool,
{
    fn is_alive(&self, pid: Pid) -> bool {
        self(pid)
    }
}
