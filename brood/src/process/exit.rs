//! Termination results.

use std::fmt;
use std::process::ExitStatus;

/// How a child ended.
///
/// For an observed exit exactly one of `code`/`signal` is set. Both are `None`
/// when the handle was detached before the exit was seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitResult {
    pub code: Option<i32>,
    /// Signal name, e.g. `"SIGTERM"`.
    pub signal: Option<String>,
}

impl ExitResult {
    /// Result for a handle whose exit was never observed.
    pub const fn unobserved() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub const fn is_observed(&self) -> bool {
        self.code.is_some() || self.signal.is_some()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitResult {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self {
                code: Some(code),
                signal: None,
            };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self {
                    code: None,
                    signal: Some(signal_name(sig)),
                };
            }
        }

        Self::unobserved()
    }
}

#[cfg(unix)]
fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map_or_else(|_| format!("signal {sig}"), |s| s.as_str().to_string())
}

fn or_null<T: fmt::Display>(v: Option<&T>) -> String {
    v.map_or_else(|| "null".to_string(), ToString::to_string)
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code {} and signal {}",
            or_null(self.code.as_ref()),
            or_null(self.signal.as_ref())
        )
    }
}
