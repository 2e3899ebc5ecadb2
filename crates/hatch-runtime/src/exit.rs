use crate::RuntimeError;
use std::fmt;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exit code {0} is outside the valid range 0-255")]
pub struct InvalidExitCode(pub i64);

/// A process exit status in the range 0-255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ExitCode(u8);

impl ExitCode {
    pub const SUCCESS: Self = Self(0);
    pub const FAILURE: Self = Self(1);

    pub fn new(code: i64) -> Result<Self, InvalidExitCode> {
        u8::try_from(code)
            .map(Self)
            .map_err(|_| InvalidExitCode(code))
    }

    pub fn is_valid(code: i64) -> bool {
        (0..=255).contains(&code)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// 125 and 126 come from the container engine itself rather than the
    /// executed program, and are safe to retry.
    pub fn is_transient(self) -> bool {
        matches!(self.0, 125 | 126)
    }

    /// Convert a finished process status. A Unix process killed by a signal
    /// reports `128 + signal`, as shells do.
    pub fn from_status(status: ExitStatus) -> Result<Self, InvalidExitCode> {
        if let Some(code) = status.code() {
            return Self::new(i64::from(code));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::new(128 + i64::from(signal));
            }
        }
        Ok(Self::FAILURE)
    }
}

impl TryFrom<i32> for ExitCode {
    type Error = InvalidExitCode;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::new(i64::from(code))
    }
}

impl From<u8> for ExitCode {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        i32::from(code.0)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one execution. Captured output is only filled in when the
/// caller asked for capture.
#[derive(Debug, Default)]
pub struct ExecResult {
    pub exit_code: ExitCode,
    pub error: Option<RuntimeError>,
    pub output: String,
    pub err_output: String,
}

impl ExecResult {
    pub fn from_exit(exit_code: ExitCode) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// A launch or configuration failure: exit code 1 plus the error.
    pub fn failure(error: impl Into<RuntimeError>) -> Self {
        Self {
            exit_code: ExitCode::FAILURE,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Map a process status into a result. Statuses that do not fit an exit
    /// code become a failure rather than being clamped.
    pub fn from_status(status: Result<ExitStatus, RuntimeError>) -> Self {
        match status.and_then(|s| ExitCode::from_status(s).map_err(RuntimeError::from)) {
            Ok(code) => Self::from_exit(code),
            Err(e) => Self::failure(e),
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: String, err_output: String) -> Self {
        self.output = output;
        self.err_output = err_output;
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code.is_success() && self.error.is_none()
    }
}
