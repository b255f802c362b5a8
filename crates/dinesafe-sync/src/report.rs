//! Per-run report files and the recent-runs digest.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::PipelineRunSummary;

pub const RUN_SUMMARY_FILE: &str = "run_summary.md";
pub const RUN_JSON_FILE: &str = "run.json";

pub fn render_run_summary(summary: &PipelineRunSummary) -> String {
    let tasks = summary
        .tasks
        .iter()
        .map(|t| {
            format!(
                "- {}: {} ms, {} attempt(s){}",
                t.name,
                t.elapsed_ms,
                t.attempts,
                if t.succeeded { "" } else { ", failed" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# DineSafe Pipeline Run\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Snapshots requested: {}\n\
         - Snapshots downloaded: {}\n\
         - Snapshots transformed: {}\n\
         - Rows inserted: {} (skipped {} duplicates)\n\
         - Inspections aggregated: {}\n\
         - Multi-day inspections removed: {}\n\
         - Re-inspections removed: {}\n\
         - Inspections labeled: {}\n\
         - Geocoded addresses: {} resolved, {} not found, {} timed out\n\n\
         ## Labels\n{}\n\n\
         ## Tasks\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.snapshots_requested,
        summary.snapshots_downloaded,
        summary.snapshots_transformed.len(),
        summary.load.rows_inserted,
        summary.load.rows_skipped,
        summary.inspections_aggregated,
        summary.multi_day_removed,
        summary.reinspections_removed,
        summary.inspections_labeled,
        summary.geocode.resolved,
        summary.geocode.not_found,
        summary.geocode.timeouts,
        summary.labels.to_markdown(),
        tasks,
    )
}

/// Write `run_summary.md` and `run.json` into the run's report directory.
pub async fn write_run_reports(reports_dir: &Path, summary: &PipelineRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(RUN_SUMMARY_FILE), render_run_summary(summary))
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(RUN_JSON_FILE), json)
        .await
        .context("writing run.json")?;
    Ok(())
}

/// Digest of the most recent `runs` report directories, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(RUN_JSON_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# DineSafe Pipeline Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let run_path = dir.path().join(RUN_JSON_FILE);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let run: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&run_path)
                .with_context(|| format!("reading {}", run_path.display()))?,
        )
        .with_context(|| format!("parsing {}", run_path.display()))?;
        let count = |path: &[&str]| {
            path.iter()
                .try_fold(&run, |value, key| value.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let finished = run
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!("- rows inserted: {}", count(&["load", "rows_inserted"])));
        lines.push(format!("- inspections labeled: {}", count(&["inspections_labeled"])));
        lines.push(format!("- addresses geocoded: {}", count(&["geocode", "resolved"])));
        if let Some(classes) = run
            .get("labels")
            .and_then(|v| v.get("classes"))
            .and_then(|v| v.as_array())
        {
            for class in classes {
                let label = class.get("label").and_then(|v| v.as_bool()).unwrap_or(false);
                let fraction = class.get("fraction").and_then(|v| v.as_f64()).unwrap_or(0.0);
                lines.push(format!("- label {}: {:.4}", u8::from(label), fraction));
            }
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- summary: `{}`", dir.path().join(RUN_SUMMARY_FILE).display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
