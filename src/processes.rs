use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::CommandSpec,
    error::CommandError,
    models::{LogSource, ProcessRecord},
    store::HistoryStore,
};

/// Rows of the process query, in source order.
#[derive(Debug, Default, PartialEq)]
pub struct ProcessRows {
    pub records: Vec<ProcessRecord>,
    pub malformed: Vec<String>,
}

/// Memory values the driver uses when it cannot attribute usage.
fn is_unsupported(value: &str) -> bool {
    value.starts_with('[') && value.ends_with(']')
}

/// Parses one `pid, name, used_memory` row.
///
/// The name is everything between the first and last comma, so names that
/// contain commas survive.
pub fn parse_row(row: &str) -> Option<ProcessRecord> {
    let (pid, rest) = row.split_once(',')?;
    let (name, memory) = rest.rsplit_once(',')?;

    let pid = pid.trim().parse::<u32>().ok().filter(|pid| *pid > 0)?;
    let memory = memory.trim();
    let used_memory_mib = if is_unsupported(memory) {
        None
    } else {
        Some(memory.parse::<u64>().ok()?)
    };

    Some(ProcessRecord {
        pid,
        name: name.trim().to_string(),
        used_memory_mib,
    })
}

/// Parses the whole query output. A leading header row is skipped.
pub fn parse_rows(output: &str) -> ProcessRows {
    let mut rows = ProcessRows::default();

    for (i, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_row(line) {
            Some(record) => rows.records.push(record),
            None if i == 0 && line.to_ascii_lowercase().starts_with("pid") => {}
            None => rows.malformed.push(line.to_string()),
        }
    }

    rows
}

/// Periodically replaces the store's process snapshot.
pub struct ProcessSampler {
    command: CommandSpec,
    store: Arc<HistoryStore>,
    interval: Duration,
    query_timeout: Duration,
}

impl ProcessSampler {
    pub fn new(
        command: CommandSpec,
        store: Arc<HistoryStore>,
        interval: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            command,
            store,
            interval,
            query_timeout,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        info!("Process sampler: Running every {:?}", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Dropping an in-flight query kills its child.
            select! {
                _ = token.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }

        info!("Process sampler: Quitting");
    }

    /// Runs one query. On failure the previous snapshot stays in place.
    ///
    /// Output made only of malformed rows is a failed query, not an empty
    /// process list.
    pub async fn poll_once(&self) -> Result<usize, CommandError> {
        let rows = match self.query().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("Process query failed: {err}");
                self.store.record_process_error(err.to_string());
                return Err(err);
            }
        };

        let count = rows.records.len();
        debug!("Process query returned {count} process(es)");
        self.store.replace_process_snapshot(rows.records);
        Ok(count)
    }

    async fn query(&self) -> Result<ProcessRows, CommandError> {
        let output = self.command.output(self.query_timeout).await?;
        let rows = parse_rows(&output);

        for line in &rows.malformed {
            warn!("Malformed process line: {line}");
            self.store
                .log(LogSource::Monitor, format!("WARN: Malformed process line: {line}"));
        }

        match rows.malformed.first() {
            Some(first) if rows.records.is_empty() => Err(CommandError::Unparseable {
                program: self.command.program.clone(),
                line: first.clone(),
            }),
            _ => Ok(rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_in_order() {
        let rows = parse_rows("1234,mytool,512\n5678,,1024\n");
        assert_eq!(
            rows.records,
            vec![
                ProcessRecord {
                    pid: 1234,
                    name: "mytool".into(),
                    used_memory_mib: Some(512),
                },
                ProcessRecord {
                    pid: 5678,
                    name: String::new(),
                    used_memory_mib: Some(1024),
                },
            ]
        );
        assert!(rows.malformed.is_empty());
    }

    #[test]
    fn trims_spaces_and_keeps_commas_in_names() {
        let record = parse_row("42, python train.py --a=1,2, 2048").unwrap();
        assert_eq!(record.pid, 42);
        assert_eq!(record.name, "python train.py --a=1,2");
        assert_eq!(record.used_memory_mib, Some(2048));
    }

    #[test]
    fn unsupported_memory_is_unavailable() {
        let record = parse_row("99, /usr/bin/Xorg, [N/A]").unwrap();
        assert_eq!(record.used_memory_mib, None);
    }

    #[test]
    fn skips_header_and_malformed_rows() {
        let rows = parse_rows("pid, process_name, used_gpu_memory [MiB]\n12,a,1\nbogus\n0,zero,5\n13,b,x\n");
        assert_eq!(rows.records.len(), 1);
        assert_eq!(rows.records[0].pid, 12);
        assert_eq!(rows.malformed, vec!["bogus", "0,zero,5", "13,b,x"]);
    }

    #[test]
    fn empty_output_is_an_empty_snapshot() {
        assert_eq!(parse_rows(""), ProcessRows::default());
    }
}
