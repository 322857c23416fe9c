//! Report exporters
//!
//! Writes the final consumer report to disk.

use crate::types::EventReport;
use anyhow::{Context, Result};
use std::{fs::File, io::Write, path::PathBuf};

/// Trait for report exporters
pub trait ReportExporter {
    /// Export a report
    ///
    /// # Arguments
    ///
    /// * `report` - Consumer report to export
    fn export(&self, report: &EventReport) -> Result<()>;
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl ReportExporter for JsonExporter {
    fn export(&self, report: &EventReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        let mut file = File::create(&self.output_path)
            .with_context(|| format!("Failed to create output file: {:?}", self.output_path))?;

        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", self.output_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsSnapshot;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_export() {
        let report = EventReport {
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
            consumer: "http".to_string(),
            duration_seconds: 10,
            total_events: 42,
            total_bytes: 672,
            events_per_cpu: BTreeMap::from([(0, 40), (1, 2)]),
            stats: StatsSnapshot {
                events: 42,
                invalid_batches: 1,
                ..Default::default()
            },
        };

        let path = std::env::temp_dir().join(format!("usm-events-report-{}.json", std::process::id()));
        JsonExporter::new(path.clone(), false).export(&report).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let parsed: EventReport = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.total_events, 42);
        assert_eq!(parsed.events_per_cpu.get(&1), Some(&2));
        assert_eq!(parsed.stats.invalid_batches, 1);
    }
}
