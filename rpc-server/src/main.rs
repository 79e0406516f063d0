use std::process::ExitCode;

use cardreader_rpc_server::{server, ServerConfig};
use clap::Parser;
use log::error;
use simple_logger::SimpleLogger;

fn main() -> ExitCode {
    let config = ServerConfig::parse();
    if let Err(err) = SimpleLogger::new()
        .with_level(config.log_level.into())
        .init()
    {
        eprintln!("logger init failed: {err}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("runtime init failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let local = tokio::task::LocalSet::new();
    match local.block_on(&runtime, server::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server stopped: {err}");
            ExitCode::FAILURE
        }
    }
}
