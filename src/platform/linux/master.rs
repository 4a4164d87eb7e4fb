use std::io::Read;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::consts::signal::SIGCHLD;
use signal_hook::iterator::Signals;

use crate::core::config::StarterConfig;
use crate::core::engine::{self, Engine};
use crate::platform::linux::{fused, namespaces};

/// Inputs the master receives from the native launcher.
pub struct MasterOpts {
    pub socket: i32,
    pub engine_name: String,
    pub config: StarterConfig,
    pub json: Vec<u8>,
}

/// What the reaper does with a wait status for the container pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapAction {
    /// Exit the master with the container's exit status.
    Exit(i32),
    /// Re-raise the container's terminating signal on ourselves.
    Raise(i32),
    /// Not a termination; keep waiting.
    Ignore,
}

pub fn action_for(status: WaitStatus) -> ReapAction {
    match status {
        WaitStatus::Exited(_, code) => ReapAction::Exit(code),
        WaitStatus::Signaled(_, sig, _) => ReapAction::Raise(sig as i32),
        _ => ReapAction::Ignore,
    }
}

/// Run the master coordinator. Returns only when supervision is complete;
/// the reaper usually exits the process first.
pub fn run(opts: MasterOpts) -> Result<()> {
    // The queue must exist before any child is adopted, or an early death
    // is lost.
    let mut signals = Signals::new([SIGCHLD]).context("failed to install SIGCHLD queue")?;

    std::env::set_var("PATH", "/bin:/sbin:/usr/bin:/usr/sbin");

    if opts.socket < 0 {
        bail!("invalid master socket descriptor {}", opts.socket);
    }
    // SAFETY: the launcher hands us exclusive ownership of this fd; the
    // stream is the only owner from here on.
    let conn = unsafe { UnixStream::from_raw_fd(opts.socket) };

    let container_pid = opts.config.container_pid;

    // Held for the whole master lifetime so cleanup can still reach the
    // container's network namespace after the child is gone.
    let _netns = namespaces::pin_net_namespace(container_pid)
        .context("can't open network namespace")?;

    let engine: Arc<dyn Engine> = Arc::from(
        engine::new_engine(&opts.engine_name, &opts.json)
            .context("failed to initialize runtime engine")?,
    );

    let mut tasks = Vec::new();

    {
        let engine = engine.clone();
        tasks.push(thread::spawn(move || {
            handle_child(container_pid, &mut signals, engine.as_ref());
        }));
    }

    let (ready_tx, ready_rx) = mpsc::channel();
    {
        let engine = engine.clone();
        let rpc_stream = conn
            .try_clone()
            .context("failed to clone master connection for the control surface")?;
        tasks.push(thread::spawn(move || {
            if let Err(e) = fused::start_daemon(engine, rpc_stream, ready_tx) {
                error!("control surface daemon failed: {e:#}");
                std::process::exit(1);
            }
        }));
    }
    // The user command must observe any mounts performed during setup.
    ready_rx
        .recv()
        .context("control surface daemon exited before signalling readiness")?;

    if let Err(e) = engine.post_start_process(container_pid) {
        error!("post-start bookkeeping failed: {e:#}");
        if let Err(e) = engine.cleanup_container(None) {
            error!("container cleanup failed: {e:#}");
        }
    }

    let user_status = Arc::new(AtomicI32::new(0));
    {
        let engine = engine.clone();
        let status = user_status.clone();
        let conn = conn
            .try_clone()
            .context("failed to clone master connection for the user command")?;
        tasks.push(thread::spawn(move || {
            status.store(start_user_command(engine.as_ref()), Ordering::SeqCst);
            // Closing our half tells the peer the command is done.
            drop(conn);
        }));
    }

    {
        let engine = engine.clone();
        tasks.push(thread::spawn(move || {
            if let Err(e) = engine.monitor_container(container_pid) {
                error!("container monitor failed: {e:#}");
            }
        }));
    }

    if engine.is_run_as_instance() {
        let conn = conn
            .try_clone()
            .context("failed to clone master connection for instance handoff")?;
        tasks.push(thread::spawn(move || run_as_instance(conn)));
    }

    for task in tasks {
        let _ = task.join();
    }

    let status = user_status.load(Ordering::SeqCst);
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}

/// Consume SIGCHLD deliveries and reap the container pid. Foreign children
/// are left to their own waiters; the targeted non-blocking wait means a
/// burst of their signals can never starve this loop. On a real
/// termination, cleanup runs first and its error never changes the exit
/// reason.
fn handle_child(pid: libc::pid_t, signals: &mut Signals, engine: &dyn Engine) {
    let target = Pid::from_raw(pid);

    for _ in signals.forever() {
        let status = match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(nix::errno::Errno::ECHILD) => continue,
            Err(e) => {
                error!("wait on container pid {pid} failed: {e}");
                continue;
            }
        };

        let action = action_for(status);
        if action == ReapAction::Ignore {
            continue;
        }

        if let Err(e) = engine.cleanup_container(Some(status)) {
            error!("container cleanup failed: {e:#}");
        }

        match action {
            ReapAction::Exit(code) => {
                debug!("child exited with exit status {code}");
                std::process::exit(code);
            }
            ReapAction::Raise(sig) => {
                debug!("child exited due to signal {sig}");
                if let Ok(sig) = Signal::try_from(sig) {
                    let _ = kill(Pid::this(), sig);
                }
            }
            ReapAction::Ignore => unreachable!(),
        }
    }
}

/// Spawn the payload command with stdio passthrough and PDEATHSIG=SIGKILL
/// so it dies with the master. Returns the exit code (128+signal for a
/// signal death).
fn start_user_command(engine: &dyn Engine) -> i32 {
    let args = &engine.common().oci.process.args;
    if args.is_empty() {
        error!("engine provided no payload command");
        return 1;
    }

    let mut cmd = std::process::Command::new(&args[0]);
    cmd.args(&args[1..]);
    // SAFETY: prctl is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to start user command {}: {e}", args[0]);
            return 1;
        }
    };

    match child.wait() {
        Ok(status) => status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
        Err(e) => {
            error!("wait on user command failed: {e}");
            1
        }
    }
}

/// Instance handoff: wait for one byte on the inherited socket, give a
/// fast-failing child a moment to surface, then background ourselves.
/// EOF still backgrounds; only a read error exits.
fn run_as_instance(mut conn: UnixStream) {
    let mut data = [0u8; 1];

    match conn.read(&mut data) {
        Err(_) => std::process::exit(1),
        Ok(_) => {
            thread::sleep(Duration::from_millis(100));
            let _ = kill(Pid::this(), Signal::SIGSTOP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_child_maps_to_exit_code() {
        let status = WaitStatus::Exited(Pid::from_raw(100), 42);
        assert_eq!(action_for(status), ReapAction::Exit(42));
    }

    #[test]
    fn signaled_child_maps_to_reraise() {
        let status = WaitStatus::Signaled(Pid::from_raw(100), Signal::SIGTERM, false);
        assert_eq!(action_for(status), ReapAction::Raise(libc::SIGTERM));
    }

    #[test]
    fn still_alive_is_ignored() {
        assert_eq!(action_for(WaitStatus::StillAlive), ReapAction::Ignore);
    }

    #[test]
    fn stopped_child_is_ignored() {
        let status = WaitStatus::Stopped(Pid::from_raw(100), Signal::SIGSTOP);
        assert_eq!(action_for(status), ReapAction::Ignore);
    }

    #[test]
    fn master_rejects_bad_socket() {
        let opts = MasterOpts {
            socket: -1,
            engine_name: "stub".into(),
            config: StarterConfig::default(),
            json: Vec::new(),
        };
        assert!(run(opts).is_err());
    }
}
