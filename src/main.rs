use std::process;

use capsrun::cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = cli::parse();

    if let Err(e) = cli::commands::dispatch(args) {
        log::error!("capsrun: {e:#}");
        process::exit(1);
    }
}
