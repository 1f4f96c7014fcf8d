use std::path::PathBuf;

use chrono_tz::Tz;
use clap::Parser;

use crate::config::{
    Config, ConfigError, DEFAULT_DMON_POLL_SECS, DEFAULT_GPU_INDEX, DEFAULT_HISTORY,
    DEFAULT_NVIDIA_SMI, DEFAULT_PROC_POLL_SECS, DEFAULT_REFRESH_MS,
};

fn parse_timezone(value: &str) -> Result<Tz, String> {
    value.parse::<Tz>().map_err(|err| err.to_string())
}

/// Monitor NVIDIA GPU metrics in real-time.
#[derive(Debug, Parser)]
#[command(name = "gpumon", version, about)]
pub struct Cli {
    /// ID of the GPU to monitor
    #[arg(default_value_t = DEFAULT_GPU_INDEX)]
    pub gpu_id: u32,

    /// Number of historical data points to keep in plots
    #[arg(short = 's', long, default_value_t = DEFAULT_HISTORY)]
    pub history_size: usize,

    /// Seconds between streaming samples
    #[arg(short = 'd', long, default_value_t = DEFAULT_DMON_POLL_SECS)]
    pub dmon_poll_interval: f64,

    /// Seconds between process list queries
    #[arg(short = 'p', long, default_value_t = DEFAULT_PROC_POLL_SECS)]
    pub proc_poll_interval: f64,

    /// Timezone for displaying timestamps
    #[arg(
        short = 't',
        long,
        env = "GPUMON_TIMEZONE",
        default_value = "UTC",
        value_parser = parse_timezone
    )]
    pub timezone: Tz,

    /// Milliseconds between screen redraws
    #[arg(long, default_value_t = DEFAULT_REFRESH_MS)]
    pub refresh_ms: u64,

    /// Path of the nvidia-smi executable
    #[arg(long, default_value = DEFAULT_NVIDIA_SMI)]
    pub nvidia_smi: String,

    /// Log file (defaults to gpumon.log in the temp directory)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gpumon.log"))
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let log_file = self.log_path();
        let mut config = Config::new(
            self.gpu_id,
            self.history_size,
            self.dmon_poll_interval,
            self.proc_poll_interval,
        )?
        .with_refresh_ms(self.refresh_ms)?;

        config.timezone = self.timezone;
        config.nvidia_smi = self.nvidia_smi;
        config.log_file = Some(log_file);
        Ok(config)
    }
}
