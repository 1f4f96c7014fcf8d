//! Streaming telemetry: parsing `dmon` lines and the sampler that keeps the
//! streaming command alive.

use std::{future::pending, io, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::{
    process::ChildStderr,
    select,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::{CommandSpec, LineReader},
    config::RestartPolicy,
    error::{CommandError, DmonParseError, SamplerError},
    models::{LogSource, Reading, TelemetryStatus},
    store::HistoryStore,
};

/// Consecutive bad lines after which the sampler warns loudly.
const PARSE_ERROR_WARN_THRESHOLD: u32 = 20;

/// Unavailable marker used by the streaming tool.
const UNAVAILABLE: &str = "-";

/// Column positions of the fields we read.
///
/// A metric whose column is absent is reported as unavailable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmonLayout {
    pub gpu: usize,
    pub utilization: Option<usize>,
    pub memory: Option<usize>,
    pub power: Option<usize>,
    pub temperature: Option<usize>,
}

impl Default for DmonLayout {
    /// `gpu pwr gtemp mtemp sm mem ...`, the tool's default column order.
    fn default() -> Self {
        Self {
            gpu: 0,
            power: Some(1),
            temperature: Some(2),
            utilization: Some(4),
            memory: Some(5),
        }
    }
}

impl DmonLayout {
    /// Learns the layout from a column-name header such as `# gpu sm mem pwr`.
    ///
    /// Returns `None` for headers that name no metric (the units line).
    pub fn from_header(line: &str) -> Option<Self> {
        let names: Vec<String> = line
            .trim_start_matches('#')
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect();
        let position = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));

        let layout = Self {
            gpu: position(&["gpu", "idx"])?,
            utilization: position(&["sm"]),
            memory: position(&["mem"]),
            power: position(&["pwr"]),
            temperature: position(&["gtemp", "temp"]),
        };

        let metrics = [layout.utilization, layout.memory, layout.power, layout.temperature];
        if metrics.iter().all(Option::is_none) {
            return None;
        }
        Some(layout)
    }

    fn min_columns(&self) -> usize {
        [
            Some(self.gpu),
            self.utilization,
            self.memory,
            self.power,
            self.temperature,
        ]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.gpu)
            + 1
    }
}

/// Classification of a single line of streaming output.
#[derive(Debug, PartialEq)]
pub enum DmonLine {
    Blank,
    /// A header or separator; carries a layout when it names columns.
    Header(Option<DmonLayout>),
    Data(Reading),
}

/// Parses one line using `layout`. Trailing unknown columns are ignored.
pub fn parse_line(
    line: &str,
    layout: &DmonLayout,
    now: DateTime<Utc>,
) -> Result<DmonLine, DmonParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(DmonLine::Blank);
    }
    if line.starts_with('#') {
        return Ok(DmonLine::Header(DmonLayout::from_header(line)));
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();

    // Separators and banners have no numeric GPU column.
    let gpu_token = tokens.get(layout.gpu).copied().unwrap_or_default();
    let Ok(gpu_index) = gpu_token.parse::<u32>() else {
        if tokens.len() > layout.gpu && gpu_token.parse::<f64>().is_ok() {
            return Err(DmonParseError::NotNumeric {
                column: "gpu",
                value: gpu_token.to_string(),
            });
        }
        if tokens.len() <= layout.gpu {
            return Err(DmonParseError::TooFewColumns {
                expected: layout.min_columns(),
                found: tokens.len(),
            });
        }
        return Ok(DmonLine::Header(None));
    };

    if tokens.len() < layout.min_columns() {
        return Err(DmonParseError::TooFewColumns {
            expected: layout.min_columns(),
            found: tokens.len(),
        });
    }

    let metric = |column: Option<usize>, name: &'static str| -> Result<Option<f64>, DmonParseError> {
        let Some(token) = column.map(|i| tokens[i]) else {
            return Ok(None);
        };
        if token == UNAVAILABLE {
            return Ok(None);
        }
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(DmonParseError::NotNumeric {
                column: name,
                value: token.to_string(),
            }),
        }
    };

    Ok(DmonLine::Data(Reading {
        timestamp: now,
        gpu_index,
        utilization: metric(layout.utilization, "sm")?,
        memory: metric(layout.memory, "mem")?,
        power_watts: metric(layout.power, "pwr")?,
        temperature_c: metric(layout.temperature, "gtemp")?,
    }))
}

/// Result of feeding a line to [`DmonParser`].
#[derive(Debug, PartialEq)]
pub enum Parsed {
    Reading(Reading),
    Skipped,
    Rejected(DmonParseError),
}

/// Stateful line parser that follows header changes and counts bad lines.
#[derive(Debug, Default)]
pub struct DmonParser {
    layout: DmonLayout,
    errors: u64,
    consecutive_errors: u32,
}

impl DmonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self) -> &DmonLayout {
        &self.layout
    }

    /// Total rejected lines.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Feeds a raw output line. Bytes that are not UTF-8 reject the line.
    pub fn feed_bytes(&mut self, line: &[u8], now: DateTime<Utc>) -> Parsed {
        match std::str::from_utf8(line) {
            Ok(line) => self.feed(line, now),
            Err(_) => self.reject(DmonParseError::InvalidUtf8),
        }
    }

    pub fn feed(&mut self, line: &str, now: DateTime<Utc>) -> Parsed {
        match parse_line(line, &self.layout, now) {
            Ok(DmonLine::Data(reading)) => {
                self.consecutive_errors = 0;
                Parsed::Reading(reading)
            }
            Ok(DmonLine::Header(Some(layout))) => {
                if layout != self.layout {
                    debug!("dmon column layout: {layout:?}");
                    self.layout = layout;
                }
                Parsed::Skipped
            }
            Ok(_) => Parsed::Skipped,
            Err(err) => self.reject(err),
        }
    }

    fn reject(&mut self, err: DmonParseError) -> Parsed {
        self.errors += 1;
        self.consecutive_errors += 1;
        if self.consecutive_errors == PARSE_ERROR_WARN_THRESHOLD {
            warn!("{PARSE_ERROR_WARN_THRESHOLD} consecutive unparseable dmon lines, last: {err}");
        }
        Parsed::Rejected(err)
    }
}

/// How one launch of the streaming command ended.
enum RunEnd {
    Cancelled,
    Exited {
        readings: u64,
        uptime: std::time::Duration,
        reason: String,
    },
}

/// Keeps the streaming command running and feeds its readings into the store.
pub struct DmonSampler {
    command: CommandSpec,
    store: Arc<HistoryStore>,
    policy: RestartPolicy,
    grace: std::time::Duration,
}

impl DmonSampler {
    pub fn new(
        command: CommandSpec,
        store: Arc<HistoryStore>,
        policy: RestartPolicy,
        grace: std::time::Duration,
    ) -> Self {
        Self {
            command,
            store,
            policy,
            grace,
        }
    }

    /// Runs until cancelled or until the restart budget is spent.
    ///
    /// Only a launch that streamed readings for the policy's healthy
    /// uptime starts a fresh failure streak; every other exit adds up.
    pub async fn run(self, token: CancellationToken) -> Result<(), SamplerError> {
        info!("dmon sampler: Running `{}`", self.command);

        let mut parser = DmonParser::new();
        let mut failures = 0u32;

        loop {
            let end = match self.stream_once(&token, &mut parser).await {
                Ok(end) => end,
                Err(err) => RunEnd::Exited {
                    readings: 0,
                    uptime: std::time::Duration::ZERO,
                    reason: err.to_string(),
                },
            };

            let reason = match end {
                RunEnd::Cancelled => {
                    info!("dmon sampler: Quitting");
                    return Ok(());
                }
                RunEnd::Exited {
                    readings,
                    uptime,
                    reason,
                } => {
                    failures = self.policy.failure_streak(failures, readings, uptime);
                    reason
                }
            };

            warn!(
                "dmon sampler: launch failed ({failures}/{}): {reason}",
                self.policy.max_consecutive_failures
            );
            self.store.log(LogSource::Monitor, format!("dmon stopped: {reason}"));

            if failures >= self.policy.max_consecutive_failures {
                error!("dmon sampler: giving up after {failures} failed launches");
                self.store.set_status(TelemetryStatus::Failed {
                    reason: reason.clone(),
                });
                return Err(SamplerError::RestartsExhausted {
                    attempts: failures,
                    reason,
                });
            }

            self.store.set_status(TelemetryStatus::Restarting {
                attempt: failures,
                max: self.policy.max_consecutive_failures,
            });

            select! {
                _ = token.cancelled() => {
                    info!("dmon sampler: Quitting");
                    return Ok(());
                },
                _ = sleep(self.policy.backoff(failures)) => {}
            }
        }
    }

    async fn stream_once(
        &self,
        token: &CancellationToken,
        parser: &mut DmonParser,
    ) -> Result<RunEnd, CommandError> {
        if token.is_cancelled() {
            return Ok(RunEnd::Cancelled);
        }

        let mut child = self.command.spawn_streaming()?;
        let started = Instant::now();
        debug!("dmon sampler: child pid {:?}", child.id());

        let mut readings = 0u64;
        let mut stdout_error = None;
        let mut stderr_open = child.stderr.is_some();
        let mut cancelled = false;

        loop {
            select! {
                biased;

                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                },
                line = child.stdout.next_raw_line() => match line {
                    Ok(Some(line)) => {
                        if self.handle_line(parser, &line) {
                            readings += 1;
                            if readings == 1 {
                                self.store.set_status(TelemetryStatus::Streaming);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        stdout_error = Some(err);
                        break;
                    }
                },
                line = next_stderr_line(&mut child.stderr), if stderr_open => match line {
                    Ok(Some(line)) => {
                        warn!("dmon stderr: {line}");
                        self.store.log(LogSource::Stderr, line);
                    }
                    _ => stderr_open = false,
                },
            }
        }

        if cancelled {
            child.shutdown(self.grace).await;
            return Ok(RunEnd::Cancelled);
        }

        let reason = match stdout_error {
            Some(err) => {
                child.shutdown(self.grace).await;
                format!("reading `{}` output failed: {err}", self.command.program)
            }
            None => match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(status) => format!("`{}` exited with {}", self.command.program, status?),
                Err(_) => {
                    child.shutdown(self.grace).await;
                    format!("`{}` closed its output", self.command.program)
                }
            },
        };

        Ok(RunEnd::Exited {
            readings,
            uptime: started.elapsed(),
            reason,
        })
    }

    /// Logs and parses one stdout line; returns whether it produced a reading.
    fn handle_line(&self, parser: &mut DmonParser, raw: &[u8]) -> bool {
        let line = String::from_utf8_lossy(raw);
        trace!("dmon: {line}");
        if !line.trim_start().starts_with('#') && !line.trim().is_empty() {
            self.store.log(LogSource::Stdout, line.to_string());
        }

        match parser.feed_bytes(raw, Utc::now()) {
            Parsed::Reading(reading) => {
                self.store.append_reading(&reading);
                true
            }
            Parsed::Skipped => false,
            Parsed::Rejected(err) => {
                debug!("dmon: discarded {line:?}: {err}");
                self.store.record_parse_error(&line, &err);
                false
            }
        }
    }
}

async fn next_stderr_line(
    stderr: &mut Option<LineReader<ChildStderr>>,
) -> io::Result<Option<String>> {
    match stderr {
        Some(lines) => lines.next_line().await,
        None => pending().await,
    }
}
