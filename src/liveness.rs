use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Tells the reclaimer whether the process owning a socket still exists.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with signal 0, which performs the permission and existence checks
/// of `kill(2)` without delivering anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = match i32::try_from(pid) {
            // 0 and -1 address process groups, never a single owner
            Ok(pid) if pid > 0 => Pid::from_raw(pid),
            _ => return false,
        };
        match kill(pid, None) {
            Ok(()) => true,
            // EPERM: the process exists but belongs to someone else
            Err(e) => e != Errno::ESRCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(SignalProbe.is_alive(std::process::id()));
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SignalProbe.is_alive(pid));
    }

    #[test]
    fn group_addresses_are_never_owners() {
        assert!(!SignalProbe.is_alive(0));
        assert!(!SignalProbe.is_alive(u32::MAX));
    }
}
