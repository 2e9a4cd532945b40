//! Process-group signalling.

use crate::errors::SupervisorError;

/// Graceful and forced termination plus liveness checks for a Driver process
/// and everything in its process group.
pub trait ProcessControl: Send + Sync {
    /// SIGTERM to the process group.
    fn graceful(&self, pid: u32) -> Result<(), SupervisorError>;
    /// SIGKILL to the process group and to the bare pid.
    fn forced(&self, pid: u32) -> Result<(), SupervisorError>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real signals via `libc` on unix; a best-effort fallback elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalControl;

#[cfg(unix)]
mod imp {
    use super::*;

    fn check(pid: u32, rc: libc::c_int) -> Result<(), SupervisorError> {
        if rc == 0 {
            Ok(())
        } else {
            Err(SupervisorError::Signal {
                pid,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    /// `pid` as a positive `pid_t`. Zero and overflow would address the
    /// caller's own group or every process, so they are rejected.
    fn target(pid: u32) -> Option<libc::pid_t> {
        libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
    }

    impl ProcessControl for SignalControl {
        fn graceful(&self, pid: u32) -> Result<(), SupervisorError> {
            let Some(target) = target(pid) else {
                return Ok(());
            };
            // SAFETY: killpg has no memory-safety preconditions.
            check(pid, unsafe { libc::killpg(target, libc::SIGTERM) })
        }

        fn forced(&self, pid: u32) -> Result<(), SupervisorError> {
            let Some(target) = target(pid) else {
                return Ok(());
            };
            // SAFETY: killpg and kill have no memory-safety preconditions.
            let group = check(pid, unsafe { libc::killpg(target, libc::SIGKILL) });
            let single = check(pid, unsafe { libc::kill(target, libc::SIGKILL) });
            group.or(single)
        }

        fn is_alive(&self, pid: u32) -> bool {
            let Some(target) = target(pid) else {
                return false;
            };
            // SAFETY: signal 0 only performs the existence/permission check.
            if unsafe { libc::kill(target, 0) } == 0 {
                return true;
            }
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    impl ProcessControl for SignalControl {
        fn graceful(&self, _pid: u32) -> Result<(), SupervisorError> {
            Ok(())
        }

        fn forced(&self, _pid: u32) -> Result<(), SupervisorError> {
            Ok(())
        }

        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }
}
