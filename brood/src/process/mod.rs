//! Process spawning, lifecycle observation and stream linking.
//!
//! This module provides an async-first way to launch child processes, watch
//! their output and exit, and wire one child's stdout into another's stdin.

mod exit;
mod observer;
mod pipe;
mod runner;
mod spawn;
mod stdin;

pub use exit::ExitResult;
pub use observer::{ChannelObserver, NullObserver, ProcessEvent, ProcessObserver, StderrRelay};
pub use pipe::{chain, PipeLink};
pub use runner::{HandleId, ProcessHandle, ProcessRunner};
pub use spawn::{ProcessSpec, StreamKind, StreamMode};
pub use stdin::StdinWriter;

#[cfg(unix)]
pub use nix::sys::signal::Signal;
