//! Runtime configuration.
//!
//! There are no config files: defaults live here and the CLI overrides them.

use std::path::PathBuf;
use std::time::Duration;

/// Process-wide defaults that would otherwise be ambient state.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used for `use_shell` specs.
    pub shell: PathBuf,
    /// Flag that makes the shell treat its next argument as a command line.
    pub shell_flag: String,
    /// Whether children start from the orchestrator's environment.
    pub inherit_env: bool,
    /// Size of each read from a child's stdout/stderr.
    pub chunk_size: usize,
    /// Chunks buffered between the two halves of a pipe link before the
    /// reading half stops pulling from the producer.
    pub link_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let (shell, shell_flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("/bin/sh", "-c")
        };

        Self {
            shell: PathBuf::from(shell),
            shell_flag: shell_flag.to_string(),
            inherit_env: true,
            chunk_size: 8192,
            link_buffer: 16,
        }
    }
}

/// Demo HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bound on how long `/compute` waits for its worker. `None` waits forever.
    pub worker_timeout: Option<Duration>,
    /// Exclusive upper bound of the summation the compute worker performs.
    pub compute_upto: u64,
}

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPUTE_UPTO: u64 = 1_000_000_000;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            worker_timeout: Some(DEFAULT_WORKER_TIMEOUT),
            compute_upto: DEFAULT_COMPUTE_UPTO,
        }
    }
}
