mod config;
mod lockfile;
mod protocol;
mod server;
mod session;

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::lockfile::LockFile;

/// Another instance kept the port after the bind retries ran out.
const EXIT_RUNNING: u8 = 1;
const EXIT_FAILURE: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "php-remote-daemon",
    about = "Drives PHP subprocesses for remote clients over a binary socket protocol",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stop a previously started daemon instance.
    Stop,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("{err}");
        return ExitCode::from(EXIT_FAILURE);
    }

    match cli.command {
        Some(Command::Stop) => stop(&config),
        None => run(config).await,
    }
}

fn stop(config: &Config) -> ExitCode {
    if !config.lock_file.exists() {
        info!("no running instance to stop");
        return ExitCode::SUCCESS;
    }
    match lockfile::stop_running_instance(&config.lock_file) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "failed to stop running instance");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(config: Config) -> ExitCode {
    let listener = match bind(&config).await {
        Ok(listener) => listener,
        Err(code) => return code,
    };

    let lock = match LockFile::acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(err) => {
            error!(%err, "failed to acquire lock file");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    info!(
        addr = %config.listen_addr(),
        debug = config.debug,
        "starting php-remote-daemon"
    );

    let result = tokio::select! {
        result = server::run(listener, config.clone()) => result,
        () = lock.watch() => Ok(()),
        () = shutdown_signal() => {
            info!("termination signal received, shutting down");
            Ok(())
        }
    };

    lock.release();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Binds the listen socket, deferring to a previously running instance:
/// deleting its lock file asks it to shut down, after which the port
/// frees up within a few retries.
async fn bind(config: &Config) -> Result<TcpListener, ExitCode> {
    let addr = config.listen_addr();

    if config.lock_file.exists() {
        info!("lock file found, asking the running instance to shut down");
        let _ = std::fs::remove_file(&config.lock_file);

        for attempt in 1..=10 {
            match TcpListener::bind(&addr).await {
                Ok(listener) => return Ok(listener),
                Err(err) => {
                    info!(attempt, %err, "port still busy, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        error!(%addr, "another instance is still holding the port");
        return Err(ExitCode::from(EXIT_RUNNING));
    }

    TcpListener::bind(&addr).await.map_err(|err| {
        error!(%addr, %err, "failed to bind listen socket");
        ExitCode::from(EXIT_FAILURE)
    })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut int)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        // Signal registration failing leaves only the lock file watcher
        // as a shutdown path.
        std::future::pending::<()>().await;
        return;
    };

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}
