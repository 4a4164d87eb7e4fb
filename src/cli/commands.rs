use anyhow::{Context, Result};

use crate::cli::{Cli, Command};
use crate::core::config::StarterConfig;
use crate::platform::linux::{container, master, rpc};

/// Dispatch a parsed CLI command to the appropriate role.
pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Master {
            socket,
            engine,
            config_fd,
        } => cmd_master(socket, &engine, config_fd),
        Command::Container {
            master_socket,
            rpc_socket,
            engine,
            config_fd,
        } => cmd_container(master_socket, rpc_socket, &engine, config_fd),
        Command::RpcServer { socket, engine } => cmd_rpc_server(socket, &engine),
    }
}

fn cmd_master(socket: i32, engine_name: &str, config_fd: i32) -> Result<()> {
    let (config, json) =
        StarterConfig::read_from_fd(config_fd).context("failed to read starter config")?;

    master::run(master::MasterOpts {
        socket,
        engine_name: engine_name.to_string(),
        config,
        json,
    })
}

fn cmd_container(
    master_socket: i32,
    rpc_socket: i32,
    engine_name: &str,
    config_fd: i32,
) -> Result<()> {
    let (config, json) =
        StarterConfig::read_from_fd(config_fd).context("failed to read starter config")?;

    container::run(container::ContainerOpts {
        master_socket,
        rpc_socket,
        engine_name: engine_name.to_string(),
        config,
        json,
    })
}

fn cmd_rpc_server(socket: i32, engine_name: &str) -> Result<()> {
    rpc::server_main(socket, engine_name)
}
