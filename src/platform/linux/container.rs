use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::core::config::StarterConfig;
use crate::core::engine;
use crate::platform::linux::rpc::RpcClient;

/// Inputs the container child receives from the native launcher.
pub struct ContainerOpts {
    pub master_socket: i32,
    pub rpc_socket: i32,
    pub engine_name: String,
    pub config: StarterConfig,
    pub json: Vec<u8>,
}

/// Run the container-side engine steps: wire the config, build the
/// filesystem through the privileged helper, then exec the payload.
/// Returns only on failure.
pub fn run(opts: ContainerOpts) -> Result<()> {
    if opts.master_socket < 0 || opts.rpc_socket < 0 {
        bail!(
            "invalid inherited sockets (master {}, rpc {})",
            opts.master_socket,
            opts.rpc_socket
        );
    }
    // SAFETY: the launcher hands us exclusive ownership of both fds.
    let master = unsafe { UnixStream::from_raw_fd(opts.master_socket) };
    let rpc_stream = unsafe { UnixStream::from_raw_fd(opts.rpc_socket) };

    let engine = engine::new_engine(&opts.engine_name, &opts.json)
        .context("failed to initialize runtime engine")?;

    engine.init_config().context("failed to wire engine config")?;

    // The launcher fills the pid slot before exec; fall back to our own
    // pid when running outside it.
    let pid = if opts.config.container_pid > 0 {
        opts.config.container_pid
    } else {
        nix::unistd::getpid().as_raw()
    };
    debug!("creating container as pid {pid}");

    let rpc = RpcClient::new(rpc_stream, &engine.common().name);
    engine
        .create_container(pid, &rpc)
        .context("container creation failed")?;

    // Closing the client is what moves the helper on to its pivot.
    drop(rpc);

    engine
        .start_process(master)
        .context("failed to start container process")?;

    // start_process only returns on failure; a clean exec never gets here.
    bail!("container payload did not exec");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sockets_are_rejected() {
        let opts = ContainerOpts {
            master_socket: -1,
            rpc_socket: -1,
            engine_name: "stub".into(),
            config: StarterConfig::default(),
            json: Vec::new(),
        };
        assert!(run(opts).is_err());
    }
}
