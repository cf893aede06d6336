//! Parsing of `nvidia-smi --format=csv,noheader,nounits` output

use tracing::warn;

use crate::models::GpuTelemetry;

const EXPECTED_COLUMNS: usize = 7;
const MAX_PLAUSIBLE_TEMPERATURE: i64 = 200;
const MEMORY_TOLERANCE: f64 = 0.10;

/// `N/A` and blanks read as zero.
fn parse_metric(field: &str) -> Option<i64> {
    let field = field.trim();
    if field.is_empty() || field.eq_ignore_ascii_case("n/a") || field.eq_ignore_ascii_case("[n/a]") {
        return Some(0);
    }
    field
        .parse::<i64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().map(|v| v.round() as i64))
}

/// GPU UUIDs look like `GPU-<uuid>`; the prefix is optional.
pub fn is_valid_gpu_uuid(raw: &str) -> bool {
    let bare = raw
        .strip_prefix("GPU-")
        .or_else(|| raw.strip_prefix("MIG-"))
        .unwrap_or(raw);
    uuid::Uuid::parse_str(bare).is_ok()
}

fn validate(gpu: &GpuTelemetry) -> Result<(), String> {
    if !is_valid_gpu_uuid(&gpu.uuid) {
        return Err(format!("invalid GPU UUID '{}'", gpu.uuid));
    }
    if gpu.temperature > MAX_PLAUSIBLE_TEMPERATURE || gpu.temperature < 0 {
        return Err(format!("implausible temperature {}C", gpu.temperature));
    }
    if !(0..=100).contains(&gpu.utilization) {
        return Err(format!("utilization {}% out of range", gpu.utilization));
    }

    let reported = gpu.memory_used + gpu.memory_free;
    let drift = (reported - gpu.memory_total).abs() as f64;
    if gpu.memory_total > 0 && drift > gpu.memory_total as f64 * MEMORY_TOLERANCE {
        warn!(
            gpu = %gpu.uuid,
            total = gpu.memory_total,
            used = gpu.memory_used,
            free = gpu.memory_free,
            "GPU memory figures are inconsistent"
        );
    }
    Ok(())
}

/// Parse the telemetry query output, dropping malformed rows with a warning.
pub fn parse_telemetry(output: &str) -> Vec<GpuTelemetry> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(output.as_bytes());

    let mut gpus = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line + 1, error = %e, "Unreadable GPU telemetry row");
                continue;
            }
        };
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if record.len() != EXPECTED_COLUMNS {
            warn!(line = line + 1, columns = record.len(), "GPU telemetry row has wrong column count");
            continue;
        }

        let metrics: Option<Vec<i64>> = (2..EXPECTED_COLUMNS).map(|i| parse_metric(&record[i])).collect();
        let Some(metrics) = metrics else {
            warn!(line = line + 1, row = ?record, "Non-numeric GPU telemetry value");
            continue;
        };

        let gpu = GpuTelemetry {
            uuid: record[0].to_string(),
            name: record[1].to_string(),
            memory_total: metrics[0],
            memory_used: metrics[1],
            memory_free: metrics[2],
            temperature: metrics[3],
            utilization: metrics[4],
        };

        match validate(&gpu) {
            Ok(()) => gpus.push(gpu),
            Err(reason) => warn!(line = line + 1, reason = %reason, "Dropping GPU telemetry row"),
        }
    }
    gpus
}
