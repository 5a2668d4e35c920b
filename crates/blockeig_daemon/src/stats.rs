use blockeig_core::adaptive::{ControllerStats, Policy};
use blockeig_core::reorder::ReorderStats;
use blockeig_core::scheduler::{MapperStats, StealStats};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of one control tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: u64,
    pub converged: bool,
    pub iterations: u32,
    pub eigenvalue: f64,
    pub max_error: f64,
    pub threshold: f64,
    pub elapsed_ms: f64,
}

/// JSON summary written at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub timestamp: u64,
    pub seed: u64,
    pub dimension: usize,
    pub ticks: Vec<TickRecord>,
    pub final_policy: Option<Policy>,
    pub reorder: ReorderStats,
    pub controller: ControllerStats,
    pub steals: StealStats,
    pub mapper: MapperStats,
}

impl RunSummary {
    pub fn new(seed: u64, dimension: usize) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            seed,
            dimension,
            ticks: Vec::new(),
            final_policy: None,
            reorder: ReorderStats::default(),
            controller: ControllerStats::default(),
            steals: StealStats::default(),
            mapper: MapperStats::default(),
        }
    }

    pub fn converged(&self) -> usize {
        self.ticks.iter().filter(|t| t.converged).count()
    }

    pub fn total_iterations(&self) -> u64 {
        self.ticks.iter().map(|t| t.iterations as u64).sum()
    }

    pub fn mean_iterations(&self) -> f64 {
        if self.ticks.is_empty() {
            0.0
        } else {
            self.total_iterations() as f64 / self.ticks.len() as f64
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tick: u64, converged: bool, iterations: u32) -> TickRecord {
        TickRecord {
            tick,
            converged,
            iterations,
            eigenvalue: 5.0,
            max_error: 1e-6,
            threshold: 1e-4,
            elapsed_ms: 1.0,
        }
    }

    #[test]
    fn test_aggregates() {
        let mut summary = RunSummary::new(1, 8);
        assert_eq!(summary.mean_iterations(), 0.0);
        summary.ticks.push(record(0, true, 10));
        summary.ticks.push(record(1, false, 30));
        assert_eq!(summary.converged(), 1);
        assert_eq!(summary.total_iterations(), 40);
        assert_eq!(summary.mean_iterations(), 20.0);
    }

    #[test]
    fn test_save_writes_json() {
        let mut summary = RunSummary::new(7, 16);
        summary.ticks.push(record(0, true, 12));
        let path = std::env::temp_dir().join(format!("blockeig-stats-{}.json", std::process::id()));
        summary.save(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(json["seed"], 7);
        assert_eq!(json["ticks"][0]["iterations"], 12);
        assert!(json["final_policy"].is_null());
    }
}
