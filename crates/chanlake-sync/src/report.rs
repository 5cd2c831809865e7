use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::dag::StepReport;
use crate::loader::LoadReport;
use crate::validation::ValidationReport;

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub today: chrono::NaiveDate,
    pub steps: Vec<StepReport>,
}

impl TransformReport {
    pub fn rows(&self, relation: &str) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.relation == relation)
            .map(|s| s.rows)
    }

    pub fn coercion_failures(&self) -> usize {
        self.steps.iter().map(|s| s.coercion_failures.total()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub messages: LoadReport,
    pub detections: LoadReport,
    pub transform: TransformReport,
    pub validation: ValidationReport,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.validation.passed()
    }
}

/// Fields of `run_summary.json` read back by the recent-runs report.
#[derive(Debug, Deserialize)]
struct StoredSummary {
    finished_at: DateTime<Utc>,
    messages: StoredLoad,
    validation: StoredValidation,
}

#[derive(Debug, Deserialize)]
struct StoredLoad {
    loaded: usize,
    #[serde(default)]
    failures: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StoredValidation {
    results: Vec<StoredCheck>,
}

#[derive(Debug, Deserialize)]
struct StoredCheck {
    name: String,
    passed: bool,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

pub fn brief_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Chanlake Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Messages: {} loaded, {} already loaded, {} failed",
            summary.messages.loaded,
            summary.messages.skipped,
            summary.messages.failures.len()
        ),
        format!(
            "- Detection sidecars: {} loaded, {} failed",
            summary.detections.loaded,
            summary.detections.failures.len()
        ),
        format!("- Nulled casts: {}", summary.transform.coercion_failures()),
        String::new(),
        "## Relations".to_string(),
    ];
    for step in &summary.transform.steps {
        lines.push(format!("- {}: {} rows", step.relation, step.rows));
    }

    lines.push(String::new());
    lines.push("## Checks".to_string());
    let failed = summary.validation.failed_names();
    if failed.is_empty() {
        lines.push(format!("- all {} checks passed", summary.validation.results.len()));
    } else {
        for name in failed {
            lines.push(format!("- FAILED `{name}`"));
        }
    }

    let skipped: Vec<_> = summary
        .messages
        .failures
        .iter()
        .chain(&summary.detections.failures)
        .collect();
    if !skipped.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped Units".to_string());
        for failure in skipped {
            lines.push(format!("- `{}`: {}", failure.unit_key, failure.reason));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `run_summary.json` and `brief.md` into the run directory.
pub async fn write_run_reports(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;
    Ok(())
}

/// Markdown overview of the most recent `runs` run directories.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let path = entry.path().join("run_summary.json");
        if !path.exists() {
            continue;
        }
        let stored: StoredSummary = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((entry.file_name().to_string_lossy().to_string(), entry.path(), stored));
    }
    summaries.sort_by(|a, b| b.2.finished_at.cmp(&a.2.finished_at));

    let mut lines = vec!["# Chanlake Recent Runs".to_string(), String::new()];
    for (run_id, dir, stored) in summaries.into_iter().take(runs.max(1)) {
        let failed: Vec<_> = stored
            .validation
            .results
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {}", stored.finished_at));
        lines.push(format!("- messages loaded: {}", stored.messages.loaded));
        lines.push(format!("- malformed units: {}", stored.messages.failures.len()));
        if failed.is_empty() {
            lines.push("- checks: passed".to_string());
        } else {
            lines.push(format!("- checks failed: {}", failed.join(", ")));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadFailure;
    use crate::validation::CheckResult;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn summary(failed_check: bool) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            messages: LoadReport {
                scanned: 3,
                loaded: 2,
                failures: vec![LoadFailure {
                    unit_key: "telegram_messages/2025-07-14/chemedapp/3".into(),
                    reason: "invalid json".into(),
                }],
                ..Default::default()
            },
            detections: LoadReport {
                scanned: 1,
                failures: vec![LoadFailure {
                    unit_key: "image_detections/2025-07-14/chemedapp/2".into(),
                    reason: "missing detections array".into(),
                }],
                ..Default::default()
            },
            transform: TransformReport {
                today: NaiveDate::from_ymd_opt(2025, 7, 14).unwrap(),
                steps: vec![],
            },
            validation: ValidationReport {
                results: vec![CheckResult {
                    name: "unique_dim_channels_channel_id".into(),
                    passed: !failed_check,
                    failing_rows: usize::from(failed_check),
                    error: None,
                }],
            },
            reports_dir: String::new(),
            parquet_manifest: None,
        }
    }

    #[test]
    fn brief_lists_failed_checks_and_skipped_units() {
        let brief = brief_markdown(&summary(true));
        assert!(brief.contains("FAILED `unique_dim_channels_channel_id`"));
        assert!(brief.contains("telegram_messages/2025-07-14/chemedapp/3"));
        assert!(brief.contains("- `image_detections/2025-07-14/chemedapp/2`: missing detections array"));
        assert!(brief_markdown(&summary(false)).contains("all 1 checks passed"));
    }

    #[tokio::test]
    async fn written_reports_feed_the_recent_runs_overview() {
        let dir = tempdir().unwrap();
        let s = summary(false);
        let run = run_dir(dir.path(), s.run_id);
        write_run_reports(&run, &s).await.unwrap();
        assert!(run.join("brief.md").exists());

        let overview = recent_runs_markdown(dir.path(), 5).unwrap();
        assert!(overview.contains(&s.run_id.to_string()));
        assert!(overview.contains("messages loaded: 2"));
        assert!(overview.contains("checks: passed"));
    }
}
