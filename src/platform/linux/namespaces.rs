use std::fs::File;

use anyhow::{Context, Result};
use nix::sched::CloneFlags;

/// The namespace set a container child is created in: mount, pid, UTS,
/// IPC, and network.
pub fn container_ns_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
}

/// Open the network namespace of `pid` and return the handle. The master
/// keeps this open for its whole lifetime so the namespace outlives an
/// early container death and cleanup can still reach it.
pub fn pin_net_namespace(pid: libc::pid_t) -> Result<File> {
    let path = format!("/proc/{pid}/ns/net");
    File::open(&path).with_context(|| format!("can't open network namespace {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_is_stable() {
        let flags = container_ns_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn own_net_namespace_can_be_pinned() {
        let pid = std::process::id() as libc::pid_t;
        assert!(pin_net_namespace(pid).is_ok());
    }

    #[test]
    fn missing_pid_fails() {
        // PID 0 has no /proc entry.
        assert!(pin_net_namespace(0).is_err());
    }
}
