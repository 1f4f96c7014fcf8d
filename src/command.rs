use std::{fmt, io, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    time::timeout,
};
use tracing::{debug, warn};

use crate::error::CommandError;

/// An external program and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell command line, handy for tests and stand-in tools.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Runs to completion and returns stdout.
    ///
    /// A non-zero exit is an error; the child is killed if `limit` elapses.
    pub async fn output(&self, limit: Duration) -> Result<String, CommandError> {
        debug!("Running `{self}`");

        let output = timeout(limit, self.command().output())
            .await
            .map_err(|_| CommandError::TimedOut {
                program: self.program.clone(),
                timeout: limit,
            })?
            .map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::NonZeroExit {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Starts a long-lived child with piped stdout and stderr.
    pub fn spawn_streaming(&self) -> Result<StreamingChild, CommandError> {
        debug!("Spawning `{self}`");

        let mut child = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CommandError::MissingStdout {
            program: self.program.clone(),
        })?;
        let stderr = child.stderr.take();

        Ok(StreamingChild {
            program: self.program.clone(),
            child,
            stdout: LineReader::new(stdout),
            stderr: stderr.map(LineReader::new),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Splits a byte stream into lines without requiring UTF-8.
///
/// Partial lines survive a dropped read, so reads can race in `select!`.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Next line as raw bytes, without the line ending. `None` at end of stream.
    pub async fn next_raw_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.inner.read_until(b'\n', &mut self.pending).await?;
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.pending);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Next line with invalid UTF-8 replaced.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .next_raw_line()
            .await?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }
}

/// A running streaming command.
///
/// The child is killed if this is dropped; [`StreamingChild::shutdown`]
/// asks it to exit first and only kills it after the grace period.
pub struct StreamingChild {
    program: String,
    child: Child,
    pub stdout: LineReader<ChildStdout>,
    pub stderr: Option<LineReader<ChildStderr>>,
}

impl StreamingChild {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the child to exit on its own, after its output ended.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, CommandError> {
        self.child.wait().await.map_err(|source| CommandError::Io {
            program: self.program.clone(),
            source,
        })
    }

    /// Terminates the child and reaps it.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        self.terminate();
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("`{}` stopped with {status}", self.program),
            Ok(Err(err)) => warn!("Failed to reap `{}`: {err}", self.program),
            Err(_) => {
                warn!("`{}` ignored termination request, killing it", self.program);
                if let Err(err) = self.child.kill().await {
                    warn!("Failed to kill `{}`: {err}", self.program);
                }
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` belongs to a child we have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!("Failed to kill `{}`: {err}", self.program);
        }
    }
}
