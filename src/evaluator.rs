//! Timeline and report sink.
//!
//! Appends one CSV row per logging interval and writes the JSON snapshots at
//! finalization. The CSV column set is the contract with the external plot
//! generator; changing it breaks downstream tooling.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::monitor::MonitorStats;
use crate::GrizzlyResult;

const TIMELINE_HEADER: &str =
    "elapsed_s,total_execs,exec_rate,total_crashes,saved_crashes,total_hangs,saved_hangs,coverage_bits";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimelineRow {
    pub elapsed_s: f64,
    pub total_execs: u64,
    pub exec_rate: f64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub coverage_bits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub target: String,
    pub args: String,
    pub duration_s: f64,
    pub total_execs: u64,
    pub exec_rate: f64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub coverage_bits: u32,
    pub total_seeds: usize,
}

#[derive(Debug)]
pub struct Evaluator {
    output_dir: PathBuf,
    csv_path: PathBuf,
}

impl Evaluator {
    pub fn new(output_dir: &Path) -> GrizzlyResult<Self> {
        std::fs::create_dir_all(output_dir)?;
        let csv_path = output_dir.join("timeline.csv");
        std::fs::write(&csv_path, format!("{TIMELINE_HEADER}\n"))?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            csv_path,
        })
    }

    pub fn record(&self, row: &TimelineRow) -> GrizzlyResult<()> {
        let mut file = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            file,
            "{:.1},{},{:.1},{},{},{},{},{}",
            row.elapsed_s,
            row.total_execs,
            row.exec_rate,
            row.total_crashes,
            row.saved_crashes,
            row.total_hangs,
            row.saved_hangs,
            row.coverage_bits
        )?;
        Ok(())
    }

    pub fn write_stats(&self, stats: &MonitorStats) -> GrizzlyResult<()> {
        let mut value = serde_json::to_value(stats)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "end_time".to_string(),
                serde_json::Value::String(wall_time_iso_utc()),
            );
        }
        let path = self.output_dir.join("stats.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&value)?)?;
        Ok(())
    }

    pub fn save_final_report(&self, report: &FinalReport) -> GrizzlyResult<()> {
        let path = self.output_dir.join("final_report.json");
        std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
        tracing::info!(file = %path.display(), "final report saved");
        Ok(())
    }
}

/// RFC3339 wall-clock timestamp for run metadata; never used for control
/// flow.
pub fn wall_time_iso_utc() -> String {
    let dt: time::OffsetDateTime = std::time::SystemTime::now().into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_output(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("grizzly-eval-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn timeline_has_header_and_rows() {
        let out = temp_output("timeline");
        let eval = Evaluator::new(&out).expect("evaluator");
        eval.record(&TimelineRow {
            elapsed_s: 10.0,
            total_execs: 1234,
            exec_rate: 123.4,
            total_crashes: 2,
            saved_crashes: 1,
            total_hangs: 0,
            saved_hangs: 0,
            coverage_bits: 77,
        })
        .expect("record");

        let text = std::fs::read_to_string(out.join("timeline.csv")).expect("read csv");
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(TIMELINE_HEADER));
        assert_eq!(lines.next(), Some("10.0,1234,123.4,2,1,0,0,77"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn stats_json_gets_an_end_time() {
        let out = temp_output("stats");
        let eval = Evaluator::new(&out).expect("evaluator");
        eval.write_stats(&MonitorStats::default()).expect("stats");

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("stats.json")).expect("read"))
                .expect("parse");
        assert!(value.get("end_time").is_some());
        assert!(value.get("total_execs").is_some());
    }
}
