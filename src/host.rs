//! Facts about the machine and its CPU / system memory load.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::{
    select,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    models::{Metric, Sample, NOT_AVAILABLE},
    store::HistoryStore,
};

const BYTES_PER_GB: f64 = 1e9;

/// Static description of the host, collected once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub arch: String,
    pub cpu_brand: Option<String>,
    pub logical_cpus: usize,
    pub total_memory_bytes: u64,
}

impl HostInfo {
    pub fn collect(sys: &System) -> Self {
        Self {
            hostname: System::host_name(),
            os: System::long_os_version(),
            kernel: System::kernel_version(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_brand: sys
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .filter(|brand| !brand.is_empty()),
            logical_cpus: sys.cpus().len(),
            total_memory_bytes: sys.total_memory(),
        }
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = |v: &Option<String>| v.as_deref().unwrap_or(NOT_AVAILABLE).to_string();
        let cpus = match self.logical_cpus {
            0 => NOT_AVAILABLE.to_string(),
            n => n.to_string(),
        };
        let ram = match self.total_memory_bytes {
            0 => NOT_AVAILABLE.to_string(),
            bytes => format!("{:.2} GB", bytes as f64 / BYTES_PER_GB),
        };

        write!(
            f,
            "{} | {} | {} | {} | CPU: {} | Logical CPUs: {} | Total RAM: {}",
            text(&self.hostname),
            text(&self.os),
            text(&self.kernel),
            self.arch,
            text(&self.cpu_brand),
            cpus,
            ram
        )
    }
}

/// `used` as a percentage of `total`; `None` when the total is unknown.
pub fn percent(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used as f64 / total as f64 * 100.0)
}

/// Samples CPU usage and system memory into the store.
pub struct HostSampler {
    store: Arc<HistoryStore>,
    interval: Duration,
}

impl HostSampler {
    pub fn new(store: Arc<HistoryStore>, interval: Duration) -> Self {
        Self {
            store,
            // CPU usage is meaningless over shorter windows
            interval: interval.max(MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        info!("Host sampler: Running every {:?}", self.interval);

        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let host = HostInfo::collect(&sys);
        info!("Host: {host}");
        self.store.set_host(host);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires at once, before any CPU time has elapsed
        ticker.tick().await;

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.sample(&mut sys),
            }
        }

        info!("Host sampler: Quitting");
    }

    fn sample(&self, sys: &mut System) {
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let at = Utc::now();
        let cpu = f64::from(sys.global_cpu_usage());
        let memory = percent(sys.used_memory(), sys.total_memory());
        debug!("Host sample: cpu {cpu:.1}%, memory {memory:?}");

        self.store.append(
            Metric::Cpu,
            Sample {
                at,
                value: cpu.is_finite().then_some(cpu),
            },
        );
        self.store.append(Metric::SystemMemory, Sample { at, value: memory });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_marks_missing_fields() {
        let host = HostInfo {
            hostname: Some("rig".into()),
            os: Some("Linux 24.04 Ubuntu".into()),
            arch: "x86_64".into(),
            logical_cpus: 32,
            total_memory_bytes: 64_000_000_000,
            ..HostInfo::default()
        };

        assert_eq!(
            host.to_string(),
            "rig | Linux 24.04 Ubuntu | N/A | x86_64 | CPU: N/A | Logical CPUs: 32 | Total RAM: 64.00 GB"
        );
    }

    #[test]
    fn percent_of_unknown_total_is_unavailable() {
        assert_eq!(percent(1, 0), None);
        assert_eq!(percent(25, 100), Some(25.0));
    }

    #[test]
    fn interval_is_never_below_cpu_minimum() {
        let sampler = HostSampler::new(Arc::new(HistoryStore::new(1)), Duration::from_millis(1));
        assert_eq!(sampler.interval, MINIMUM_CPU_UPDATE_INTERVAL);
    }
}
