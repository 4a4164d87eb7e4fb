use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, error};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::core::config::CONTAINER_FINALDIR;

/// Perform a mount with raw flag bits as received over RPC. An empty
/// fstype together with MS_BIND means a bind mount; the kernel ignores
/// fstype for binds anyway, we just avoid passing an empty string where
/// `None` is meant.
pub fn mount_with_flags(
    source: &str,
    target: &str,
    fstype: &str,
    flags: u64,
    options: &str,
) -> Result<()> {
    let flags = MsFlags::from_bits_truncate(flags as libc::c_ulong);
    let fstype = if fstype.is_empty() { None } else { Some(fstype) };
    let options = if options.is_empty() {
        None
    } else {
        Some(options)
    };
    let source = if source.is_empty() {
        None
    } else {
        Some(source)
    };

    mount(source, target, fstype, flags, options).with_context(|| {
        format!("failed to mount {} at {target}", source.unwrap_or("none"))
    })?;
    Ok(())
}

/// Chroot into `path` and move to the new root.
pub fn chroot(path: &str) -> Result<()> {
    nix::unistd::chroot(path).with_context(|| format!("chroot into {path} failed"))?;
    nix::unistd::chdir("/").context("chdir / after chroot")?;
    Ok(())
}

/// The privileged pivot: replace the helper's root with the container
/// final directory. Individual failures are logged and the sequence still
/// proceeds — later steps can mask earlier errors, and stopping halfway
/// leaves the process in a worse root than forcing completion.
pub fn pivot_into_final() {
    if let Err(e) = nix::unistd::chdir(Path::new(CONTAINER_FINALDIR)) {
        error!("failed to change directory to {CONTAINER_FINALDIR}: {e}");
    }

    debug!("called pivot_root({CONTAINER_FINALDIR}, etc)");
    if let Err(e) = nix::unistd::pivot_root(".", "etc") {
        error!("pivot_root {CONTAINER_FINALDIR}: {e}");
    }

    debug!("called chroot({CONTAINER_FINALDIR})");
    if let Err(e) = nix::unistd::chroot(".") {
        error!("chroot: {e}");
    }

    debug!("called unmount(etc, MNT_DETACH)");
    if let Err(e) = umount2("etc", MntFlags::MNT_DETACH) {
        error!("unmount pivot_root dir: {e}");
    }

    debug!("changing directory to / to avoid getpwd issues");
    if let Err(e) = nix::unistd::chdir("/") {
        error!("chdir /: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_surfaces_kernel_errors() {
        // Unprivileged mounts fail; what matters is a typed error with
        // context, not a panic.
        let err = mount_with_flags(
            "/nonexistent-source",
            "/nonexistent-target",
            "",
            libc::MS_BIND as u64,
            "",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent-target"));
    }
}
