use std::time::Duration;

use tracing::{info, warn};

use crate::{
    command::CommandSpec,
    error::CommandError,
    models::{GpuIdentity, LogSource},
    store::HistoryStore,
};

/// Value of a `Label : value` line, if `line` carries `label`.
fn field<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim() != label {
        return None;
    }
    let value = value.trim();
    (!value.is_empty() && !value.eq_ignore_ascii_case("N/A")).then_some(value)
}

/// Leading number of a value such as `24564 MiB` or `450.00 W`.
fn leading_number(value: &str) -> Option<&str> {
    value.split_whitespace().next()
}

/// Extracts identity fields from the device report.
///
/// Labels are matched anywhere in the block; missing labels stay unavailable.
/// The total memory is the first `Total` inside the `FB Memory Usage` section.
pub fn parse_identity(report: &str) -> GpuIdentity {
    let mut identity = GpuIdentity::unavailable();
    let mut in_fb_memory = false;

    for line in report.lines() {
        let trimmed = line.trim();
        // Section titles carry no `:`.
        if !trimmed.is_empty() && !trimmed.contains(':') {
            in_fb_memory = trimmed == "FB Memory Usage";
            continue;
        }

        if identity.name.is_none() {
            identity.name = field(line, "Product Name").map(str::to_string);
        }
        if identity.driver_version.is_none() {
            identity.driver_version = field(line, "Driver Version").map(str::to_string);
        }
        if identity.cuda_version.is_none() {
            identity.cuda_version = field(line, "CUDA Version").map(str::to_string);
        }
        if identity.max_power_watts.is_none() {
            identity.max_power_watts = field(line, "Max Power Limit")
                .and_then(leading_number)
                .and_then(|v| v.parse().ok());
        }
        if in_fb_memory && identity.total_memory_mib.is_none() {
            identity.total_memory_mib = field(line, "Total")
                .and_then(leading_number)
                .and_then(|v| v.parse().ok());
        }
    }

    identity
}

/// Runs the identity query once.
pub async fn fetch_identity(
    command: &CommandSpec,
    limit: Duration,
) -> Result<GpuIdentity, CommandError> {
    let report = command.output(limit).await?;
    Ok(parse_identity(&report))
}

/// Fetches the identity and stores it. Failure leaves every field unavailable.
pub async fn load_identity(command: &CommandSpec, limit: Duration, store: &HistoryStore) {
    let identity = match fetch_identity(command, limit).await {
        Ok(identity) => {
            info!("GPU identity: {identity}");
            identity
        }
        Err(err) => {
            warn!("GPU identity query failed: {err}");
            store.log(LogSource::Monitor, format!("GPU info query failed: {err}"));
            GpuIdentity::unavailable()
        }
    };
    store.set_identity(identity);
}
