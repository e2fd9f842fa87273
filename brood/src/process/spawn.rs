//! Launch parameters and their translation into a `tokio` command.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use clap::ValueEnum;
use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::{ProcessError, Result};

/// How a child's standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StreamMode {
    /// The child uses the orchestrator's terminal streams directly.
    #[default]
    Inherit,
    /// stdin, stdout and stderr are pipes owned by the handle.
    Piped,
    /// Inherited streams, own process group, never waited on.
    Detached,
}

/// One of a child's three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable path, or a whole command line when `use_shell` is set.
    pub program: String,

    /// Arguments; must be empty in shell mode.
    pub args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// Variables set on top of (or instead of, see
    /// [`RunnerConfig::inherit_env`]) the orchestrator's environment.
    pub env: Option<HashMap<String, String>>,

    /// Run `program` through the configured shell.
    pub use_shell: bool,

    pub stream_mode: StreamMode,
}

impl ProcessSpec {
    /// Spec for running `program` directly, with inherited streams.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Spec for running `command_line` through the shell.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self {
            program: command_line.into(),
            use_shell: true,
            ..Self::default()
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (k, v) in vars {
            env.insert(k.into(), v.into());
        }
        self
    }

    pub const fn stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Shorthand for `stream_mode(StreamMode::Piped)`.
    pub const fn piped(self) -> Self {
        self.stream_mode(StreamMode::Piped)
    }

    /// Shorthand for `stream_mode(StreamMode::Detached)`.
    pub const fn detached(self) -> Self {
        self.stream_mode(StreamMode::Detached)
    }

    /// Human-readable label for logs.
    pub fn display_name(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Build the OS command for this spec.
    pub(crate) fn to_command(&self, config: &RunnerConfig) -> Result<Command> {
        if self.program.trim().is_empty() {
            return Err(ProcessError::InvalidSpec("program is empty".into()));
        }

        let mut cmd = if self.use_shell {
            // Shell mode takes one command line; an argument list would be
            // silently reinterpreted by the shell.
            if !self.args.is_empty() {
                return Err(ProcessError::InvalidSpec(
                    "shell mode takes a single command line, not an argument list".into(),
                ));
            }
            let mut c = Command::new(&config.shell);
            c.arg(&config.shell_flag).arg(&self.program);
            c
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.args);
            c
        };

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if !config.inherit_env {
            cmd.env_clear();
        }

        if let Some(ref env) = self.env {
            cmd.envs(env);
        }

        match self.stream_mode {
            StreamMode::Piped => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            StreamMode::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            StreamMode::Detached => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                // Own process group: terminal signals aimed at the
                // orchestrator do not reach the child.
                #[cfg(unix)]
                cmd.process_group(0);
            }
        }

        Ok(cmd)
    }
}
