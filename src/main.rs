//! cpacfstatsd entry point.
//!
//! `main` stays synchronous: detaching forks the process, which has to happen
//! before the tokio runtime starts any thread.

mod args;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use cpacfstatsd::backend::Backend;
use cpacfstatsd::daemon::shutdown::signal_name;
use cpacfstatsd::daemon::{self, DaemonServer, PidFile};
use cpacfstatsd::logging::{self, LogTarget};
use cpacfstatsd::DaemonConfig;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("cpacfstatsd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = DaemonConfig::load().context("failed to load configuration")?;

    PidFile::new(&config.pid_path).check()?;

    let target = if cli.foreground {
        LogTarget::Stderr
    } else {
        daemon::daemonize()?;
        LogTarget::File(config.log_path.clone())
    };
    logging::init(target)?;
    info!("cpacfstatsd {} starting", env!("CARGO_PKG_VERSION"));

    let _pid = PidFile::new(&config.pid_path).write()?;

    let backend = open_backend(&config)?;
    info!("Counter backend initialized");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;
    let result = runtime.block_on(serve(&config, Arc::clone(&backend)));

    backend.shutdown();

    match result? {
        Some(sig) => info!("Terminated by {}", signal_name(sig)),
        None => info!("Stopped"),
    }
    Ok(())
}

async fn serve(config: &DaemonConfig, backend: Arc<dyn Backend>) -> cpacfstatsd::Result<Option<i32>> {
    let server = DaemonServer::bind(config, backend)?;
    let _signals = server.install_signal_handlers()?;
    server.run().await
}

#[cfg(target_os = "linux")]
fn open_backend(config: &DaemonConfig) -> Result<Arc<dyn Backend>> {
    use cpacfstatsd::backend::PerfBackend;
    use cpacfstatsd::DaemonError;

    let backend = PerfBackend::init(&config.sysfs_root).map_err(DaemonError::BackendInit)?;
    Ok(Arc::new(backend))
}

#[cfg(not(target_os = "linux"))]
fn open_backend(_config: &DaemonConfig) -> Result<Arc<dyn Backend>> {
    use cpacfstatsd::{BackendError, DaemonError};

    Err(DaemonError::BackendInit(BackendError::unsupported()).into())
}
