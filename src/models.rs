use std::fmt;

use chrono::{DateTime, Utc};

/// Shown wherever a value is unknown.
pub const NOT_AVAILABLE: &str = "N/A";

/// One parsed line of streaming telemetry.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub gpu_index: u32,
    /// `None` when the source reported the column as unavailable.
    pub utilization: Option<f64>,
    pub memory: Option<f64>,
    pub power_watts: Option<f64>,
    pub temperature_c: Option<f64>,
}

impl Reading {
    /// Value of a GPU metric; host metrics are never part of a reading.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Utilization => self.utilization,
            Metric::Memory => self.memory,
            Metric::Power => self.power_watts,
            Metric::Temperature => self.temperature_c,
            Metric::Cpu | Metric::SystemMemory => None,
        }
    }
}

/// The sampled time series, in display order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    Utilization,
    Memory,
    Power,
    Temperature,
    Cpu,
    SystemMemory,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Utilization,
        Metric::Memory,
        Metric::Power,
        Metric::Temperature,
        Metric::Cpu,
        Metric::SystemMemory,
    ];

    /// Series fed by the streaming GPU telemetry.
    pub const GPU: [Metric; 4] = [
        Metric::Utilization,
        Metric::Memory,
        Metric::Power,
        Metric::Temperature,
    ];

    pub fn is_gpu(self) -> bool {
        Self::GPU.contains(&self)
    }

    pub fn title(self) -> &'static str {
        match self {
            Metric::Utilization => "Utilization (%)",
            Metric::Memory => "Memory (%)",
            Metric::Power => "Power (W)",
            Metric::Temperature => "Temperature (°C)",
            Metric::Cpu => "CPU Usage (%)",
            Metric::SystemMemory => "System Memory (%)",
        }
    }
}

/// A buffered point of one metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: Option<f64>,
}

/// A process currently holding GPU memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// May be empty when the source omits it.
    pub name: String,
    /// `None` when the driver reports the amount as not supported.
    pub used_memory_mib: Option<u64>,
}

/// Static facts about the monitored GPU, fetched once at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpuIdentity {
    pub name: Option<String>,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
    pub total_memory_mib: Option<u64>,
    pub max_power_watts: Option<f64>,
}

impl GpuIdentity {
    /// Identity with every field marked unavailable.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

impl fmt::Display for GpuIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let vram = self
            .total_memory_mib
            .map(|mib| format!("{mib} MiB"))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        write!(
            f,
            "{} | Driver: {} | CUDA: {} | VRAM: {}",
            text(&self.name),
            text(&self.driver_version),
            text(&self.cuda_version),
            vram
        )
    }
}

/// Lifecycle of the streaming sampler as seen by readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TelemetryStatus {
    Starting,
    Streaming,
    Restarting { attempt: u32, max: u32 },
    /// Terminal: no more telemetry will arrive this session.
    Failed { reason: String },
}

impl TelemetryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TelemetryStatus::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    Monitor,
}

/// An entry of the raw output log panel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
}
