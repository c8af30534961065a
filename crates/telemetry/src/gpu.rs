use anyhow::Result;
use steward_core::DeviceSnapshot;

use crate::process::run_tool;

/// Columns requested from `nvidia-smi`, in this order.
pub const QUERY_FIELDS: &str =
    "index,name,memory.total,memory.used,utilization.gpu,temperature.gpu";

/// Ask the driver for every visible device.
pub async fn query_devices() -> Result<Vec<DeviceSnapshot>> {
    let query = format!("--query-gpu={}", QUERY_FIELDS);
    let out = run_tool("nvidia-smi", &[&query, "--format=csv,noheader,nounits"]).await?;
    Ok(parse_query_output(&out))
}

/// Indices of the devices the driver can see.
pub async fn visible_device_ids() -> Result<Vec<u32>> {
    let out = run_tool(
        "nvidia-smi",
        &["--query-gpu=index", "--format=csv,noheader,nounits"],
    )
    .await?;
    Ok(out
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Parse `--format=csv,noheader,nounits` output. Malformed rows are skipped;
/// `[N/A]` readings become zero, or `None` for the temperature.
pub fn parse_query_output(out: &str) -> Vec<DeviceSnapshot> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_row)
        .collect()
}

fn parse_row(line: &str) -> Option<DeviceSnapshot> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        return None;
    }
    Some(DeviceSnapshot {
        id: parts[0].parse().ok()?,
        name: parts[1].to_string(),
        memory_total: parse_reading(parts[2]).unwrap_or(0.0) as u64,
        memory_used: parse_reading(parts[3]).unwrap_or(0.0) as u64,
        utilization_pct: parse_reading(parts[4]).unwrap_or(0.0) as f32,
        temperature_c: parse_reading(parts[5]).map(|t| t as f32),
    })
}

fn parse_reading(raw: &str) -> Option<f64> {
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_devices() {
        let out = "0, NVIDIA A100-SXM4-80GB, 81920, 1024, 37, 41\n\
                   1, NVIDIA A100-SXM4-80GB, 81920, 70000, 99, 77\n";
        let devices = parse_query_output(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, 0);
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(devices[1].memory_used, 70000);
        assert_eq!(devices[1].utilization_pct, 99.0);
        assert_eq!(devices[1].temperature_c, Some(77.0));
    }

    #[test]
    fn tolerates_missing_readings_and_junk() {
        let out = "0, Tesla T4, 15360, 0, [N/A], [N/A]\nnot a row\n\n";
        let devices = parse_query_output(out);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].utilization_pct, 0.0);
        assert_eq!(devices[0].temperature_c, None);
    }
}
