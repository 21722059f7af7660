use crate::model::RunResult;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get the base directory for storing application data.
fn base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bufferbloat-cli")
}

/// Get the directory for storing test run results.
fn runs_dir() -> PathBuf {
    base_dir().join("runs")
}

/// Ensure the necessary directories exist for storing data.
pub fn ensure_dirs() -> Result<()> {
    std::fs::create_dir_all(runs_dir()).context("create runs dir")?;
    Ok(())
}

pub fn save_run(result: &RunResult) -> Result<PathBuf> {
    ensure_dirs()?;
    let path = get_run_path(result)?;
    let data = serde_json::to_vec_pretty(result)?;
    std::fs::write(&path, data).context("write run json")?;
    Ok(path)
}

pub fn get_run_path(result: &RunResult) -> Result<PathBuf> {
    let ts = &result.timestamp_utc;
    let safe_ts = ts.replace(':', "-").replace('T', "_");
    Ok(runs_dir().join(format!("run-{safe_ts}-{}.json", result.meas_id)))
}

pub fn export_json(path: &Path, result: &RunResult) -> Result<()> {
    let data = serde_json::to_vec_pretty(result)?;
    std::fs::write(path, data).context("write export json")?;
    Ok(())
}

pub fn export_csv(path: &Path, result: &RunResult) -> Result<()> {
    let mut out = String::new();
    out.push_str("timestamp_utc,base_url,meas_id,download_mbps,upload_mbps,baseline_median_ms,baseline_loss,dl_loaded_median_ms,dl_loaded_p75_ms,dl_loaded_loss,ul_loaded_median_ms,ul_loaded_p75_ms,ul_loaded_loss,bidi_loaded_median_ms,warmup_fallback\n");
    out.push_str(&format!(
        "{},{},{},{:.3},{:.3},{:.3},{:.6},{:.3},{:.3},{:.6},{:.3},{:.3},{:.6},{:.3},{}\n",
        csv_escape(&result.timestamp_utc),
        csv_escape(&result.base_url),
        csv_escape(&result.meas_id),
        result.download.mbps,
        result.upload.mbps,
        result.baseline_latency.median_ms.unwrap_or(f64::NAN),
        result.baseline_latency.loss,
        result.loaded_latency_download.median_ms.unwrap_or(f64::NAN),
        result.loaded_latency_download.p75_ms.unwrap_or(f64::NAN),
        result.loaded_latency_download.loss,
        result.loaded_latency_upload.median_ms.unwrap_or(f64::NAN),
        result.loaded_latency_upload.p75_ms.unwrap_or(f64::NAN),
        result.loaded_latency_upload.loss,
        result.loaded_latency_bidirectional.median_ms.unwrap_or(f64::NAN),
        result.warmup_fallback,
    ));
    std::fs::write(path, out).context("write export csv")?;
    Ok(())
}

/// Escape a string for CSV format (handles commas, quotes, and newlines).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LatencySummary, ThroughputSummary};

    fn sample_result() -> RunResult {
        RunResult {
            version: Some("0.1.0".into()),
            timestamp_utc: "2025-01-02T03:04:05Z".into(),
            base_url: "http://127.0.0.1:8080".into(),
            meas_id: "42".into(),
            baseline_latency: LatencySummary::default(),
            loaded_latency_download: LatencySummary::default(),
            loaded_latency_upload: LatencySummary::default(),
            loaded_latency_bidirectional: LatencySummary::default(),
            download: ThroughputSummary::empty(),
            upload: ThroughputSummary::empty(),
            bidirectional_download: ThroughputSummary::empty(),
            bidirectional_upload: ThroughputSummary::empty(),
            warmup_download: None,
            warmup_upload: None,
            warmup_fallback: false,
            phase_history: Vec::new(),
        }
    }

    #[test]
    fn run_path_is_filesystem_safe() {
        let path = get_run_path(&sample_result()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains(':'));
        assert!(name.starts_with("run-"));
        assert!(name.ends_with("-42.json"));
    }

    #[test]
    fn csv_escape_quotes_specials() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn result_round_trips_through_json() {
        let r = sample_result();
        let json = serde_json::to_string(&r).unwrap();
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.meas_id, r.meas_id);
        assert_eq!(back.timestamp_utc, r.timestamp_utc);
    }
}
