//! Privilege helpers for the test harness. Tests that exercise privileged
//! paths call `ensure_privilege` and skip when not root; tests that must
//! not run privileged drop to the first unprivileged identity found up the
//! parent process chain and restore it afterwards.

use std::fs;

use anyhow::{bail, Context, Result};
use nix::unistd::{setegid, seteuid, Gid, Uid};

/// PPid/Uid/Gid pulled from `/proc/<pid>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub ppid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Parse the PPid/Uid/Gid lines of `/proc/<pid>/status`.
pub fn proc_info(pid: libc::pid_t) -> Result<ProcInfo> {
    let status = fs::read_to_string(format!("/proc/{pid}/status"))
        .with_context(|| format!("failed to open /proc/{pid}/status"))?;

    let mut info = ProcInfo {
        ppid: 0,
        uid: 0,
        gid: 0,
    };
    for line in status.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("PPid:") => {
                info.ppid = fields.next().unwrap_or("0").parse().unwrap_or(0);
            }
            Some("Uid:") => {
                info.uid = fields.next().unwrap_or("0").parse().unwrap_or(0);
            }
            Some("Gid:") => {
                info.gid = fields.next().unwrap_or("0").parse().unwrap_or(0);
            }
            _ => {}
        }
    }
    Ok(info)
}

/// Walk up the parent chain from `pid` until a process with a non-root uid
/// appears, and return its (uid, gid).
pub fn unpriv_ids(mut pid: libc::pid_t) -> Result<(libc::uid_t, libc::gid_t)> {
    loop {
        if pid <= 1 {
            bail!("no unprivileged process found in parent chain");
        }
        let info = proc_info(pid)?;
        if info.uid != 0 {
            return Ok((info.uid, info.gid));
        }
        pid = info.ppid;
    }
}

/// True when the current effective uid is root.
pub fn is_privileged() -> bool {
    Uid::effective().is_root()
}

/// Drop effective privilege to the nearest unprivileged ancestor identity.
/// Returns the (uid, gid) to hand back to [`reset_privilege`]. No-op when
/// already unprivileged.
pub fn drop_privilege() -> Result<Option<(Uid, Gid)>> {
    if !is_privileged() {
        return Ok(None);
    }

    let saved = (Uid::effective(), Gid::effective());
    let (uid, gid) = unpriv_ids(std::process::id() as libc::pid_t)?;
    setegid(Gid::from_raw(gid)).context("failed to drop effective gid")?;
    seteuid(Uid::from_raw(uid)).context("failed to drop effective uid")?;
    Ok(Some(saved))
}

/// Restore the effective identity saved by [`drop_privilege`].
pub fn reset_privilege(saved: Option<(Uid, Gid)>) -> Result<()> {
    if let Some((uid, gid)) = saved {
        seteuid(uid).context("failed to restore effective uid")?;
        setegid(gid).context("failed to restore effective gid")?;
    }
    Ok(())
}
