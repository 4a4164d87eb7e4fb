pub mod commands;

use clap::{Parser, Subcommand};

/// capsrun — starter for single-application containers.
///
/// This binary is not meant to be invoked by hand: the native launcher
/// forks it into its three roles and hands each one inherited file
/// descriptors via the integer flags below.
#[derive(Parser, Debug)]
#[command(name = "capsrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the master coordinator (hidden; launcher use only).
    #[command(hide = true)]
    Master {
        /// Inherited master/container control socket.
        #[arg(long)]
        socket: i32,

        /// Engine name selecting the runtime variant.
        #[arg(long)]
        engine: String,

        /// Inherited descriptor carrying the starter config block plus
        /// the engine JSON.
        #[arg(long)]
        config_fd: i32,
    },

    /// Run the container-side engine steps and exec the payload (hidden).
    #[command(hide = true)]
    Container {
        /// Inherited master/container control socket.
        #[arg(long)]
        master_socket: i32,

        /// Inherited RPC socket connected to the privileged helper.
        #[arg(long)]
        rpc_socket: i32,

        /// Engine name selecting the runtime variant.
        #[arg(long)]
        engine: String,

        /// Inherited descriptor carrying the starter config block plus
        /// the engine JSON.
        #[arg(long)]
        config_fd: i32,
    },

    /// Serve privileged engine requests, then pivot and exit (hidden).
    #[command(hide = true)]
    RpcServer {
        /// Inherited RPC socket.
        #[arg(long)]
        socket: i32,

        /// Engine name the server registers under.
        #[arg(long)]
        engine: String,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
