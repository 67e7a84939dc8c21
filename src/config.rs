//! Daemon configuration drawn from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

/// Default lock file name, placed in the system temp directory.
const LOCK_FILE_NAME: &str = "php-remote-daemon.lock";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host (`PHP_INTERPRETER_HOST`).
    pub host: String,
    /// Listen port (`PHP_INTERPRETER_PORT`).
    pub port: u16,
    /// Verbose frame logging (`PHP_INTERPRETER_DEBUG`).
    pub debug: bool,
    /// Interpreter binary substituted for a leading `php` token
    /// (`PHP_INTERPRETER_BINARY`).
    pub binary: String,
    /// Wall-clock limit per subprocess (`PHP_INTERPRETER_TIMEOUT`, seconds).
    pub timeout: Option<Duration>,
    /// Single-instance lock file (`PHP_INTERPRETER_LOCK_FILE`, mainly for
    /// tests).
    pub lock_file: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env_or("PHP_INTERPRETER_HOST", "localhost");

        let port = match std::env::var("PHP_INTERPRETER_PORT") {
            Ok(raw) => raw
                .parse()
                .context("PHP_INTERPRETER_PORT must be a port number")?,
            Err(_) => 1337,
        };

        let debug = std::env::var("PHP_INTERPRETER_DEBUG")
            .map(|raw| !raw.is_empty() && raw != "0" && !raw.eq_ignore_ascii_case("false"))
            .unwrap_or(false);

        let binary = env_or("PHP_INTERPRETER_BINARY", "php");

        let timeout = match std::env::var("PHP_INTERPRETER_TIMEOUT") {
            Ok(raw) => {
                let seconds: f64 = raw
                    .parse()
                    .context("PHP_INTERPRETER_TIMEOUT must be a number of seconds")?;
                ensure!(
                    seconds.is_finite() && seconds >= 0.0,
                    "PHP_INTERPRETER_TIMEOUT must be non-negative"
                );
                Some(Duration::from_secs_f64(seconds))
            }
            Err(_) => None,
        };

        let lock_file = std::env::var("PHP_INTERPRETER_LOCK_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join(LOCK_FILE_NAME));

        Ok(Self {
            host,
            port,
            debug,
            binary,
            timeout,
            lock_file,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}
