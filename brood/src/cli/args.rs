//! CLI argument definitions.

use clap::{Args, Parser, Subcommand};

use brood::logging::LogLevel;
use brood::process::StreamMode;
use brood::worker::WorkerKind;

/// Brood - spawn, pipe and fork child processes
#[derive(Parser, Debug)]
#[command(name = "brood")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log verbosity (overrides BROOD_LOG)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one program and report its output and exit
    Run {
        /// Treat PROGRAM as a shell command line
        #[arg(long)]
        shell: bool,

        /// Working directory for the child
        #[arg(long)]
        cwd: Option<String>,

        /// Extra environment variable (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// How the child's standard streams are wired
        #[arg(long, value_enum, default_value_t = StreamMode::Piped)]
        mode: StreamMode,

        /// Program (or command line with --shell)
        program: String,

        /// Arguments for PROGRAM
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Link stages stdout-to-stdin, left to right, and print the last output
    Pipe {
        /// Feed this process's stdin into the first stage
        #[arg(long)]
        stdin: bool,

        /// Run each stage through the shell
        #[arg(long)]
        shell: bool,

        /// One command per stage (split on whitespace unless --shell)
        #[arg(required = true, value_name = "STAGE")]
        stages: Vec<String>,
    },

    /// Fork the ticker worker and exchange a few messages with it
    Fork {
        #[command(flatten)]
        ticker: TickerArgs,

        /// Messages to print before stopping the worker
        #[arg(short, long, default_value = "3")]
        count: usize,
    },

    /// Start the compute demo server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Seconds to wait for a worker before answering 504
        #[arg(long, default_value = "30", conflicts_with = "no_timeout")]
        worker_timeout: u64,

        /// Wait for workers indefinitely
        #[arg(long)]
        no_timeout: bool,

        #[command(flatten)]
        compute: ComputeArgs,

        /// Open browser automatically
        #[arg(long)]
        open: bool,
    },

    /// Run a built-in worker on stdin/stdout (used by fork and serve)
    #[command(hide = true)]
    Worker {
        #[arg(value_enum)]
        kind: WorkerKind,

        #[command(flatten)]
        ticker: TickerArgs,

        #[command(flatten)]
        compute: ComputeArgs,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct TickerArgs {
    /// Milliseconds between ticker messages
    #[arg(long, default_value = "1000")]
    pub interval_ms: u64,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ComputeArgs {
    /// Exclusive upper bound of the compute worker's summation
    #[arg(long, default_value = "1000000000")]
    pub upto: u64,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}
