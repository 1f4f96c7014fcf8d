use std::{io, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Failure to run an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("`{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("`{program}` produced no stdout pipe")]
    MissingStdout { program: String },
    #[error("`{program}` printed nothing usable, first line: {line:?}")]
    Unparseable { program: String, line: String },
    #[error("I/O error while waiting on `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl CommandError {
    /// True when the program itself could not be found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// A streaming line that could not be turned into a reading.
#[derive(Debug, Error, PartialEq)]
pub enum DmonParseError {
    #[error("expected at least {expected} columns, found {found}")]
    TooFewColumns { expected: usize, found: usize },
    #[error("column `{column}` is not numeric: {value:?}")]
    NotNumeric { column: &'static str, value: String },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Terminal failure of the streaming sampler.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("streaming telemetry stopped after {attempts} failed launches: {reason}")]
    RestartsExhausted { attempts: u32, reason: String },
}

/// Conditions that prevent the monitor from starting at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("monitoring command `{0}` was not found")]
    MissingCommand(String),
    #[error("GPU index {index} is not present ({available} GPU(s) detected)")]
    InvalidGpuIndex { index: u32, available: usize },
    #[error(transparent)]
    Query(#[from] CommandError),
}
