use crate::models::{FailedItem, RunSummary, ValuationResult};
use crate::pipeline::RunOutcome;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Final artifact of a run: results best-margin-first, failures listed
/// explicitly. Rendering beyond the JSON file is a downstream concern.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub results: Vec<ValuationResult>,
    pub failures: Vec<FailedItem>,
}

impl RunReport {
    pub fn new(summary: RunSummary, outcome: RunOutcome) -> Self {
        let mut results = outcome.results;
        results.sort_by(compare_by_margin);
        let mut failures = outcome.failures;
        failures.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Self {
            summary,
            results,
            failures,
        }
    }

    /// Writes the report as pretty JSON named after the run id.
    pub async fn write_json(&self, output_dir: &Path) -> Result<PathBuf, ReportError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let path = output_dir.join(format!("report-{}.json", self.summary.run_id));
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, body).await?;
        info!(
            target = "lotscout.report",
            path = %path.display(),
            results = self.results.len(),
            failures = self.failures.len(),
            "report written"
        );
        Ok(path)
    }
}

/// Highest margin first; items without a computable margin sink to the end.
fn compare_by_margin(a: &ValuationResult, b: &ValuationResult) -> Ordering {
    match (a.profit_margin, b.profit_margin) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.item_id.cmp(&b.item_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;
    use chrono::Utc;
    use uuid::Uuid;

    fn result(id: &str, margin: Option<f64>) -> ValuationResult {
        ValuationResult {
            item_id: id.into(),
            estimated_value: margin.map(|m| m + 10.0),
            acquisition_cost: margin.map(|_| 10.0),
            profit_margin: margin,
            confidence: Confidence::Medium,
            price_quotes: Vec::new(),
        }
    }

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            auction_url: "https://auction.example/gallery".into(),
            started_at: now,
            finished_at: now,
            discovered: 4,
            valuated: 3,
            failed: 1,
            resumed: 0,
        }
    }

    fn outcome(results: Vec<ValuationResult>, failures: Vec<FailedItem>) -> RunOutcome {
        RunOutcome {
            results,
            failures,
            discovered: 4,
            resumed: 0,
        }
    }

    #[test]
    fn results_ordered_by_margin_desc_with_unknowns_last() {
        let report = RunReport::new(
            summary(),
            outcome(
                vec![
                    result("low", Some(5.0)),
                    result("none", None),
                    result("high", Some(80.0)),
                ],
                Vec::new(),
            ),
        );
        let order: Vec<&str> = report
            .results
            .iter()
            .map(|r| r.item_id.as_str())
            .collect();
        assert_eq!(order, vec!["high", "low", "none"]);
    }

    #[test]
    fn failures_are_always_carried() {
        let report = RunReport::new(
            summary(),
            outcome(
                Vec::new(),
                vec![FailedItem {
                    item_id: "bad".into(),
                    stage: crate::models::Stage::Extract,
                    reason: "HTTP 500".into(),
                }],
            ),
        );
        assert_eq!(report.failures.len(), 1);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn json_artifact_round_trips() {
        let dir = std::env::temp_dir().join(format!("lotscout-report-{}", Uuid::new_v4()));
        let report = RunReport::new(summary(), outcome(vec![result("a", Some(12.0))], Vec::new()));
        let path = report.write_json(&dir).await.unwrap();

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: RunReport = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].item_id, "a");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
