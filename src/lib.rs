pub mod bundle;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fs_watcher;
pub mod icon_theme;
pub mod thumbnails;

pub use bundle::{AppDirBundle, Bundle};
pub use error::{Result, ThumbnailError};
pub use icon_theme::{IconLookup, XdgIconLookup};
pub use thumbnails::Thumbnailer;

use config::{CliArgs, DaemonConfig};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("APPTHUMB_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    // Also installs the `log` bridge, which every module logs through
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

pub fn run() -> ExitCode {
    let args = match CliArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, config::USAGE);
            return ExitCode::from(2);
        }
    };
    if args.help {
        print!("{}", config::USAGE);
        return ExitCode::SUCCESS;
    }

    let mut config = match DaemonConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_args(&args);
    init_logging(config.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(daemon::serve(&config, &args)) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            log::error!("{} bundle(s) could not be thumbnailed", failed);
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
