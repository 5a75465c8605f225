//! Expiry sweeper
//!
//! Records every key-expiration event published by the store and, once a day at
//! local midnight, type-inspects each recorded key so the store reclaims the
//! expired keys nobody reads anymore. See `expiry-sweeper --help` for settings.
//!
//! Exit status: 0 on Ctrl-C or a successful `--run-once`, 1 on a fatal error,
//! 2 on invalid configuration.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use expiry_sweeper::config::{normalize_single_dash_longs, Args, WorkerConfig};
use expiry_sweeper::observability::init_tracing;
use expiry_sweeper::worker;
use std::process::ExitCode;
use tracing::error;

const EXIT_FATAL: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse_from(normalize_single_dash_longs(std::env::args_os()));

    let config = match WorkerConfig::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("expiry-sweeper: {}", e);
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    if let Err(e) = init_tracing(config.log_format) {
        eprintln!("expiry-sweeper: failed to initialize logging: {}", e);
        return ExitCode::from(EXIT_FATAL);
    }

    match worker::run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
