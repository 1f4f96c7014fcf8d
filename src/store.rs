use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock,
};

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    history::HistoryBuffer,
    host::HostInfo,
    models::{GpuIdentity, LogLine, LogSource, Metric, ProcessRecord, Reading, Sample, TelemetryStatus},
};

pub const DEFAULT_RAW_LOG_LINES: usize = 100;

/// Shared state between the samplers and the presentation loop.
///
/// Each metric buffer sits behind its own mutex that is held only for a
/// single push or copy. The process list is an immutable `Arc` that gets
/// swapped wholesale, so readers keep a complete snapshot for as long as
/// they hold it.
pub struct HistoryStore {
    utilization: Mutex<HistoryBuffer<Sample>>,
    memory: Mutex<HistoryBuffer<Sample>>,
    power: Mutex<HistoryBuffer<Sample>>,
    temperature: Mutex<HistoryBuffer<Sample>>,
    cpu: Mutex<HistoryBuffer<Sample>>,
    system_memory: Mutex<HistoryBuffer<Sample>>,

    processes: RwLock<Option<Arc<Vec<ProcessRecord>>>>,
    last_process_error: RwLock<Option<String>>,
    process_errors: AtomicU64,

    identity: OnceLock<GpuIdentity>,
    host: OnceLock<HostInfo>,
    status: RwLock<TelemetryStatus>,

    raw_log: Mutex<HistoryBuffer<LogLine>>,
    parse_errors: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HistoryStore {
    pub fn new(history_size: usize) -> Self {
        Self::with_raw_log(history_size, DEFAULT_RAW_LOG_LINES)
    }

    pub fn with_raw_log(history_size: usize, raw_log_lines: usize) -> Self {
        Self {
            utilization: Mutex::new(HistoryBuffer::new(history_size)),
            memory: Mutex::new(HistoryBuffer::new(history_size)),
            power: Mutex::new(HistoryBuffer::new(history_size)),
            temperature: Mutex::new(HistoryBuffer::new(history_size)),
            cpu: Mutex::new(HistoryBuffer::new(history_size)),
            system_memory: Mutex::new(HistoryBuffer::new(history_size)),
            processes: RwLock::new(None),
            last_process_error: RwLock::new(None),
            process_errors: AtomicU64::new(0),
            identity: OnceLock::new(),
            host: OnceLock::new(),
            status: RwLock::new(TelemetryStatus::Starting),
            raw_log: Mutex::new(HistoryBuffer::new(raw_log_lines)),
            parse_errors: AtomicU64::new(0),
        }
    }

    fn buffer(&self, metric: Metric) -> &Mutex<HistoryBuffer<Sample>> {
        match metric {
            Metric::Utilization => &self.utilization,
            Metric::Memory => &self.memory,
            Metric::Power => &self.power,
            Metric::Temperature => &self.temperature,
            Metric::Cpu => &self.cpu,
            Metric::SystemMemory => &self.system_memory,
        }
    }

    // Writers

    pub fn append(&self, metric: Metric, sample: Sample) {
        lock(self.buffer(metric)).push(sample);
    }

    /// Appends one sample per GPU metric, all stamped with the reading's time.
    pub fn append_reading(&self, reading: &Reading) {
        for metric in Metric::GPU {
            self.append(
                metric,
                Sample {
                    at: reading.timestamp,
                    value: reading.value(metric),
                },
            );
        }
    }

    pub fn replace_process_snapshot(&self, records: Vec<ProcessRecord>) {
        let snapshot = Arc::new(records);
        *self.processes.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        *self
            .last_process_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Keeps the current snapshot and remembers why the poll failed.
    pub fn record_process_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.process_errors.fetch_add(1, Ordering::Relaxed);
        self.log(LogSource::Monitor, format!("Process list update failed: {message}"));
        *self
            .last_process_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn record_parse_error(&self, line: &str, reason: impl std::fmt::Display) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.log(LogSource::Monitor, format!("Discarded line {line:?}: {reason}"));
    }

    /// Stores the identity; later calls are ignored.
    pub fn set_identity(&self, identity: GpuIdentity) -> bool {
        let stored = self.identity.set(identity).is_ok();
        if !stored {
            debug!("GPU identity already set, ignoring update");
        }
        stored
    }

    pub fn set_host(&self, host: HostInfo) -> bool {
        self.host.set(host).is_ok()
    }

    /// Updates the telemetry status. Once `Failed`, the status no longer changes.
    pub fn set_status(&self, status: TelemetryStatus) {
        let mut current = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_terminal() {
            return;
        }
        if *current != status {
            info!("Telemetry status: {:?}", status);
            *current = status;
        }
    }

    pub fn log(&self, source: LogSource, text: impl Into<String>) {
        lock(&self.raw_log).push(LogLine {
            at: Utc::now(),
            source,
            text: text.into(),
        });
    }

    // Readers

    /// Current contents of one metric buffer, oldest first.
    pub fn history(&self, metric: Metric) -> Vec<Sample> {
        lock(self.buffer(metric)).to_vec()
    }

    pub fn latest(&self, metric: Metric) -> Option<Sample> {
        lock(self.buffer(metric)).latest().copied()
    }

    /// Current process list; empty until the first successful poll.
    pub fn processes(&self) -> Arc<Vec<ProcessRecord>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Whether any process poll has succeeded yet.
    pub fn processes_polled(&self) -> bool {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Error of the most recent process poll, cleared by the next success.
    pub fn last_process_error(&self) -> Option<String> {
        self.last_process_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn process_errors(&self) -> u64 {
        self.process_errors.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn identity(&self) -> Option<&GpuIdentity> {
        self.identity.get()
    }

    pub fn host(&self) -> Option<&HostInfo> {
        self.host.get()
    }

    pub fn status(&self) -> TelemetryStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn raw_log(&self) -> Vec<LogLine> {
        lock(&self.raw_log).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(util: f64, mem: f64, power: Option<f64>) -> Reading {
        Reading {
            timestamp: Utc::now(),
            gpu_index: 0,
            utilization: Some(util),
            memory: Some(mem),
            power_watts: power,
            temperature_c: Some(60.0),
        }
    }

    fn values(store: &HistoryStore, metric: Metric) -> Vec<Option<f64>> {
        store.history(metric).iter().map(|s| s.value).collect()
    }

    #[test]
    fn readings_fill_every_gpu_buffer() {
        let store = HistoryStore::new(2);
        store.append_reading(&reading(45.0, 30.0, Some(120.5)));
        store.append_reading(&reading(47.0, 31.0, None));
        store.append_reading(&reading(50.0, 32.0, Some(130.0)));

        assert_eq!(values(&store, Metric::Utilization), vec![Some(47.0), Some(50.0)]);
        assert_eq!(values(&store, Metric::Memory), vec![Some(31.0), Some(32.0)]);
        assert_eq!(values(&store, Metric::Power), vec![None, Some(130.0)]);
        assert_eq!(store.latest(Metric::Power).and_then(|s| s.value), Some(130.0));
        assert_eq!(values(&store, Metric::Temperature), vec![Some(60.0), Some(60.0)]);
        assert!(store.history(Metric::Cpu).is_empty());
        assert!(store.history(Metric::SystemMemory).is_empty());
    }

    #[test]
    fn host_series_are_independent_of_readings() {
        let store = HistoryStore::new(3);
        store.append(
            Metric::Cpu,
            Sample {
                at: Utc::now(),
                value: Some(12.5),
            },
        );
        store.append_reading(&reading(45.0, 30.0, None));

        assert_eq!(values(&store, Metric::Cpu), vec![Some(12.5)]);
        assert_eq!(store.history(Metric::Utilization).len(), 1);

        assert!(store.set_host(HostInfo::default()));
        assert!(!store.set_host(HostInfo::default()));
    }

    #[test]
    fn empty_snapshot_differs_from_failed_poll() {
        let store = HistoryStore::new(10);
        assert!(!store.processes_polled());

        let records = vec![ProcessRecord {
            pid: 1234,
            name: "mytool".into(),
            used_memory_mib: Some(512),
        }];
        store.replace_process_snapshot(records.clone());

        store.record_process_error("nvidia-smi exited with 9");
        assert_eq!(*store.processes(), records);
        assert_eq!(store.process_errors(), 1);
        assert!(store.last_process_error().is_some());

        store.replace_process_snapshot(Vec::new());
        assert!(store.processes().is_empty());
        assert!(store.processes_polled());
        assert_eq!(store.last_process_error(), None);
    }

    #[test]
    fn replacing_snapshot_twice_does_not_grow() {
        let store = HistoryStore::new(10);
        let records = vec![
            ProcessRecord { pid: 1, name: "a".into(), used_memory_mib: Some(1) },
            ProcessRecord { pid: 2, name: "b".into(), used_memory_mib: Some(2) },
        ];

        store.replace_process_snapshot(records.clone());
        let first = store.processes();
        store.replace_process_snapshot(records.clone());

        assert_eq!(*store.processes(), records);
        assert_eq!(first, store.processes());
    }

    #[test]
    fn readers_keep_their_snapshot_across_swaps() {
        let store = HistoryStore::new(10);
        store.replace_process_snapshot(vec![ProcessRecord {
            pid: 7,
            name: "old".into(),
            used_memory_mib: None,
        }]);

        let held = store.processes();
        store.replace_process_snapshot(Vec::new());

        assert_eq!(held.len(), 1);
        assert_eq!(held[0].name, "old");
    }

    #[test]
    fn identity_is_set_once() {
        let store = HistoryStore::new(1);
        assert!(store.set_identity(GpuIdentity {
            name: Some("first".into()),
            ..GpuIdentity::default()
        }));
        assert!(!store.set_identity(GpuIdentity::unavailable()));
        assert_eq!(store.identity().and_then(|i| i.name.as_deref()), Some("first"));
    }

    #[test]
    fn failed_status_is_terminal() {
        let store = HistoryStore::new(1);
        store.set_status(TelemetryStatus::Failed { reason: "gone".into() });
        store.set_status(TelemetryStatus::Streaming);
        assert!(store.status().is_terminal());
    }

    #[test]
    fn raw_log_is_bounded() {
        let store = HistoryStore::with_raw_log(1, 3);
        for i in 0..5 {
            store.log(LogSource::Stdout, format!("line {i}"));
        }
        let texts: Vec<_> = store.raw_log().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn concurrent_writer_never_exposes_overfull_buffer() {
        let store = Arc::new(HistoryStore::new(16));
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    store.append_reading(&reading(i as f64, 0.0, None));
                }
            })
        };

        for _ in 0..1_000 {
            let history = store.history(Metric::Utilization);
            assert!(history.len() <= 16);
            assert!(history.windows(2).all(|w| w[0].value < w[1].value));
        }
        writer.join().unwrap();
        assert_eq!(store.history(Metric::Utilization).len(), 16);
    }
}
