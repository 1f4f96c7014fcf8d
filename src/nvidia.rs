use tracing::info;

use crate::{command::CommandSpec, config::Config, error::StartupError};

/// The external commands a monitoring session runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commands {
    /// Streams one telemetry line per interval until killed.
    pub dmon: CommandSpec,
    /// Lists processes holding memory on the monitored GPU.
    pub processes: CommandSpec,
    /// Dumps the full `key : value` device report.
    pub identity: CommandSpec,
    /// Lists the installed GPUs, one per line.
    pub list_gpus: CommandSpec,
}

impl Commands {
    pub fn for_config(config: &Config) -> Self {
        let smi = config.nvidia_smi.as_str();
        let gpu = config.gpu_index.to_string();
        // dmon only accepts whole seconds.
        let delay = config.dmon_interval.as_secs_f64().ceil().max(1.0) as u64;

        Self {
            dmon: CommandSpec::new(smi)
                .args(["dmon", "-d"])
                .arg(delay.to_string())
                .arg("-i")
                .arg(gpu.clone()),
            processes: CommandSpec::new(smi)
                .args([
                    "--query-compute-apps=pid,name,used_gpu_memory",
                    "--format=csv,noheader,nounits",
                    "-i",
                ])
                .arg(gpu.clone()),
            identity: CommandSpec::new(smi).args(["-q", "-i"]).arg(gpu),
            list_gpus: CommandSpec::new(smi).arg("-L"),
        }
    }
}

/// Counts `GPU <n>: ...` entries of a `-L` listing.
pub fn count_listed_gpus(listing: &str) -> usize {
    listing
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count()
}

/// Makes sure the monitoring tool runs and knows about `gpu_index`.
pub async fn preflight(commands: &Commands, config: &Config) -> Result<usize, StartupError> {
    let listing = commands
        .list_gpus
        .output(config.query_timeout)
        .await
        .map_err(|err| {
            if err.is_not_found() {
                StartupError::MissingCommand(commands.list_gpus.program.clone())
            } else {
                StartupError::Query(err)
            }
        })?;

    let available = count_listed_gpus(&listing);
    if config.gpu_index as usize >= available {
        return Err(StartupError::InvalidGpuIndex {
            index: config.gpu_index,
            available,
        });
    }

    info!("Found {available} GPU(s), monitoring GPU {}", config.gpu_index);
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builds_commands_for_the_configured_gpu() {
        let mut config = Config::new(2, 10, 1.5, 3.0).unwrap();
        config.nvidia_smi = "/opt/nvidia-smi".into();
        let commands = Commands::for_config(&config);

        assert_eq!(commands.dmon.to_string(), "/opt/nvidia-smi dmon -d 2 -i 2");
        assert_eq!(commands.identity.to_string(), "/opt/nvidia-smi -q -i 2");
        assert_eq!(
            commands.processes.args.last().map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn sub_second_interval_rounds_up_to_one() {
        let mut config = Config::default();
        config.dmon_interval = Duration::from_millis(200);
        let commands = Commands::for_config(&config);
        assert_eq!(commands.dmon.args[2], "1");
    }

    #[test]
    fn counts_listing_entries() {
        let listing = "GPU 0: NVIDIA A100 (UUID: GPU-1)\nGPU 1: NVIDIA A100 (UUID: GPU-2)\n";
        assert_eq!(count_listed_gpus(listing), 2);
        assert_eq!(count_listed_gpus(""), 0);
    }

    fn commands_with_listing(script: &str) -> Commands {
        let mut commands = Commands::for_config(&Config::default());
        commands.list_gpus = CommandSpec::shell(script);
        commands
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_index() {
        let commands = commands_with_listing("echo 'GPU 0: Test GPU (UUID: x)'");
        let mut config = Config::default();
        config.gpu_index = 1;

        let err = preflight(&commands, &config).await.unwrap_err();
        assert!(matches!(
            err,
            StartupError::InvalidGpuIndex { index: 1, available: 1 }
        ));
    }

    #[tokio::test]
    async fn preflight_reports_missing_tool() {
        let mut commands = Commands::for_config(&Config::default());
        commands.list_gpus = CommandSpec::new("gpumon-test-missing-smi").arg("-L");

        let err = preflight(&commands, &Config::default()).await.unwrap_err();
        assert!(matches!(err, StartupError::MissingCommand(_)));
    }

    #[tokio::test]
    async fn preflight_accepts_listed_gpu() {
        let commands = commands_with_listing("echo 'GPU 0: Test GPU (UUID: x)'");
        assert_eq!(preflight(&commands, &Config::default()).await.unwrap(), 1);
    }
}
