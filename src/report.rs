use crate::flow::Estimate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Outcome of the synchronized ramp: the shared estimate (r', sigma').
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SharedEstimate {
    pub estimate: Estimate,
    /// Rate the ramp froze at.
    pub rate_kbps: u64,
    pub rounds: u32,
}

/// (rho", sigma") measured while `reference` held its fixed rate.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PairEstimate {
    pub reference: IpAddr,
    pub estimate: Estimate,
}

/// Everything a sender learned. Later phases are absent when an earlier one
/// failed or when the sender runs alone.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MeasurementReport {
    pub source: IpAddr,
    pub listener: IpAddr,
    pub primary: Option<Estimate>,
    pub shared: Option<SharedEstimate>,
    pub pairwise: Vec<PairEstimate>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl MeasurementReport {
    pub fn new(source: IpAddr, listener: IpAddr) -> Self {
        MeasurementReport {
            source,
            listener,
            primary: None,
            shared: None,
            pairwise: Vec::new(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.primary.is_some()
    }

    /// Human readable result lines, one value per line.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(primary) = self.primary {
            lines.push(format!("rho = {}", primary.rho));
            lines.push(format!("sigma = {}", primary.sigma));
        }
        if let Some(shared) = self.shared {
            lines.push(format!("rho' = {}", shared.estimate.rho));
            lines.push(format!("sigma' = {}", shared.estimate.sigma));
        }
        for pair in &self.pairwise {
            lines.push(format!("rho\" = {} (reference {})", pair.estimate.rho, pair.reference));
            lines.push(format!("sigma\" = {} (reference {})", pair.estimate.sigma, pair.reference));
        }
        lines
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeasurementReport {
        let mut report = MeasurementReport::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        );
        report.primary = Some(Estimate::new(4200, 1800));
        report.shared = Some(SharedEstimate {
            estimate: Estimate::new(2100, -1),
            rate_kbps: 2200,
            rounds: 5,
        });
        report.pairwise.push(PairEstimate {
            reference: "10.0.0.3".parse().unwrap(),
            estimate: Estimate::new(3000, 950),
        });
        report
    }

    #[test]
    fn test_summary_lists_every_phase() {
        let lines = sample().summary();
        assert_eq!(lines[0], "rho = 4200");
        assert_eq!(lines[1], "sigma = 1800");
        assert_eq!(lines[2], "rho' = 2100");
        assert_eq!(lines[3], "sigma' = -1");
        assert!(lines[4].starts_with("rho\" = 3000"));
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_partial_report_summary() {
        let mut report = sample();
        report.shared = None;
        report.pairwise.clear();
        report.error = Some("peer 10.0.0.3 unavailable".into());
        assert_eq!(report.summary().len(), 2);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10.0.0.1.json");
        let report = sample();
        report.write_json(&path).unwrap();

        let back: MeasurementReport =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
