//! Per-run timing summary.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub tasks: usize,
    /// Loaded from the resume cache instead of running.
    pub cached: bool,
    pub wall_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub succeeded: bool,
    pub final_artifact: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl RunSummary {
    pub fn new(run_id: &str) -> Self {
        RunSummary {
            run_id: run_id.to_string(),
            started_at: chrono::Local::now().to_rfc3339(),
            ..RunSummary::default()
        }
    }

    pub fn record(&mut self, stage: &str, tasks: usize, cached: bool, wall: Duration) {
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            tasks,
            cached,
            wall_secs: wall.as_secs_f64(),
        });
    }

    pub fn finish(&mut self, final_artifact: Option<String>) {
        self.finished_at = Some(chrono::Local::now().to_rfc3339());
        self.succeeded = final_artifact.is_some();
        self.final_artifact = final_artifact;
    }

    pub fn total_secs(&self) -> f64 {
        self.stages.iter().map(|s| s.wall_secs).sum()
    }

    pub fn log(&self) {
        for s in &self.stages {
            info!(
                "{:<20} {:>6} tasks {:>10.1}s{}",
                s.stage,
                s.tasks,
                s.wall_secs,
                if s.cached { " (cached)" } else { "" }
            );
        }
        info!("run {} took {:.1}s", self.run_id, self.total_secs());
    }

    /// Write `summary.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
        let path = dir.join("summary.json");
        fs::write(&path, serde_json::to_vec_pretty(self)?)
            .with_context(|| path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = RunSummary::new("r1");
        summary.record("align_map1", 4, false, Duration::from_millis(1500));
        summary.record("index_correction", 2, true, Duration::ZERO);
        summary.finish(Some("tmp/r1/final.alignment".into()));
        assert!(summary.succeeded);
        assert!((summary.total_secs() - 1.5).abs() < 1e-9);
        summary.write(dir.path()).unwrap();
        let back: RunSummary =
            serde_json::from_slice(&fs::read(dir.path().join("summary.json")).unwrap()).unwrap();
        assert_eq!(back, summary);
    }
}
