//! capsrun — starter for single-application containers.
//!
//! The starter is one invocation that produces three cooperating
//! processes: a privileged master that supervises everything, a container
//! process that execs the payload, and a privileged RPC helper that
//! performs loop/mount/chroot actions inside the container's namespaces.
//! They are wired together with an inherited UNIX socket pair, and the
//! master exposes a small FUSE control surface whose file writes drive
//! the container filesystem construction over RPC.

pub mod cli;
pub mod core;
pub mod platform;
pub mod util;
