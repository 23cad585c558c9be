//! Run reports: `consolidation_report.json` and `summary.md` per run directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jst_adapters::{MatchReason, RowRejection};
use jst_core::TargetTable;
use jst_storage::{SourceIssue, SourceStatus, WriteSummary};
use serde::Serialize;
use tokio::fs;

use crate::merge::{MergeStats, RecordedConflict};
use crate::review::NearDuplicate;

pub const REPORT_JSON: &str = "consolidation_report.json";
pub const SUMMARY_MD: &str = "summary.md";

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub category: Option<TargetTable>,
    pub reason: MatchReason,
    pub rows_mapped: usize,
    pub rejections: Vec<RowRejection>,
    pub column_map: BTreeMap<String, String>,
    pub dropped_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub path: String,
    pub label: String,
    pub sha256: Option<String>,
    pub status: SourceStatus,
    pub issues: Vec<SourceIssue>,
    pub tables: Vec<TableReport>,
}

impl SourceReport {
    pub fn rows_mapped(&self) -> usize {
        self.tables.iter().map(|t| t.rows_mapped).sum()
    }

    pub fn rows_rejected(&self) -> usize {
        self.tables.iter().map(|t| t.rejections.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_db: String,
    pub dry_run: bool,
    /// Hash-addressed copy of the target taken before writing, if it existed.
    pub backup_path: Option<String>,
    pub counts_before: Option<BTreeMap<TargetTable, i64>>,
    pub counts_after: Option<BTreeMap<TargetTable, i64>>,
    pub write: Option<WriteSummary>,
    pub sources: Vec<SourceReport>,
    pub merge: BTreeMap<TargetTable, MergeStats>,
    pub conflicts: Vec<RecordedConflict>,
    pub review: Vec<NearDuplicate>,
}

fn count_cell(counts: Option<&BTreeMap<TargetTable, i64>>, table: TargetTable) -> String {
    counts
        .and_then(|c| c.get(&table))
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn reason_text(reason: &MatchReason) -> String {
    match reason {
        MatchReason::Override { key } => format!("override `{key}`"),
        MatchReason::TableName { keyword } => format!("table name ~ `{keyword}`"),
        MatchReason::Column { column, keyword } => format!("column `{column}` ~ `{keyword}`"),
        MatchReason::Unmatched => "unmatched".to_string(),
    }
}

pub fn render_markdown(report: &ConsolidationReport) -> String {
    let mut lines = vec![
        "# Consolidation Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Target: `{}`", report.target_db),
    ];
    if report.dry_run {
        lines.push("- Mode: dry run (target not modified)".to_string());
    }
    if let Some(backup) = &report.backup_path {
        lines.push(format!("- Backup: `{backup}`"));
    }

    lines.push(String::new());
    lines.push("## Row Counts".to_string());
    lines.push(String::new());
    lines.push("| table | before | after |".to_string());
    lines.push("|---|---:|---:|".to_string());
    for table in TargetTable::ALL {
        lines.push(format!(
            "| {} | {} | {} |",
            table,
            count_cell(report.counts_before.as_ref(), table),
            count_cell(report.counts_after.as_ref(), table),
        ));
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &report.sources {
        lines.push(String::new());
        lines.push(format!(
            "### {} ({:?})",
            source.label,
            source.status
        ));
        lines.push(format!("- path: `{}`", source.path));
        if let Some(hash) = &source.sha256 {
            lines.push(format!("- sha256: `{hash}`"));
        }
        lines.push(format!(
            "- rows mapped: {}, rejected: {}",
            source.rows_mapped(),
            source.rows_rejected()
        ));
        for issue in &source.issues {
            match &issue.table {
                Some(table) => lines.push(format!("- issue in `{table}`: {}", issue.message)),
                None => lines.push(format!("- issue: {}", issue.message)),
            }
        }
        for table in &source.tables {
            let category = table
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "skipped".to_string());
            lines.push(format!(
                "- `{}` -> {} ({}), {} rows, {} mapped",
                table.table,
                category,
                reason_text(&table.reason),
                table.row_count,
                table.rows_mapped
            ));
            if !table.dropped_columns.is_empty() {
                lines.push(format!("  - dropped columns: {}", table.dropped_columns.join(", ")));
            }
        }
    }

    lines.push(String::new());
    lines.push("## Merge".to_string());
    lines.push(String::new());
    for (table, stats) in &report.merge {
        lines.push(format!(
            "- {}: {} staged -> {} records ({} folded, {} conflicts)",
            table, stats.staged, stats.merged, stats.folded, stats.conflicts
        ));
    }

    if !report.conflicts.is_empty() {
        lines.push(String::new());
        lines.push("## Field Conflicts".to_string());
        lines.push(String::new());
        for conflict in &report.conflicts {
            lines.push(format!(
                "- {} `{}` {}: kept `{}`, discarded `{}` ({:?}, from {})",
                conflict.table,
                conflict.key,
                conflict.field,
                conflict.kept,
                conflict.discarded,
                conflict.resolution,
                conflict.incoming
            ));
        }
    }

    if !report.review.is_empty() {
        lines.push(String::new());
        lines.push("## Possible Duplicates (not merged)".to_string());
        lines.push(String::new());
        for item in &report.review {
            lines.push(format!(
                "- {}: `{}` ~ `{}` ({:.3})",
                item.table, item.key_a, item.key_b, item.confidence_score
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Writes both report files under `<reports_root>/<run_id>` and returns that directory.
pub async fn write_report_files(
    reports_root: &Path,
    report: &ConsolidationReport,
) -> Result<PathBuf> {
    let run_dir = reports_root.join(&report.run_id);
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing consolidation report")?;
    fs::write(run_dir.join(REPORT_JSON), json)
        .await
        .with_context(|| format!("writing {REPORT_JSON}"))?;
    fs::write(run_dir.join(SUMMARY_MD), render_markdown(report))
        .await
        .with_context(|| format!("writing {SUMMARY_MD}"))?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Resolution;
    use jst_core::SourceRef;

    fn sample() -> ConsolidationReport {
        let ts = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ConsolidationReport {
            run_id: "run-1".into(),
            started_at: ts,
            finished_at: ts,
            target_db: "unified_platform.db".into(),
            dry_run: false,
            backup_path: None,
            counts_before: None,
            counts_after: Some(TargetTable::ALL.iter().map(|t| (*t, 0)).collect()),
            write: None,
            sources: vec![SourceReport {
                path: "data/contacts.db".into(),
                label: "contacts".into(),
                sha256: None,
                status: SourceStatus::Missing,
                issues: vec![SourceIssue {
                    table: None,
                    message: "file does not exist".into(),
                }],
                tables: vec![],
            }],
            merge: BTreeMap::new(),
            conflicts: vec![RecordedConflict {
                table: TargetTable::Jobs,
                key: "OpenAI / ML Engineer".into(),
                field: "salary_min".into(),
                kept: "210000".into(),
                discarded: "200000".into(),
                resolution: Resolution::LastWriteWins,
                incoming: SourceRef {
                    database: "principal_jobs_400k".into(),
                    table: "jobs".into(),
                    row_index: 0,
                },
            }],
            review: vec![],
        }
    }

    #[test]
    fn markdown_lists_counts_issues_and_conflicts() {
        let md = render_markdown(&sample());
        assert!(md.contains("| jobs | - | 0 |"));
        assert!(md.contains("### contacts (Missing)"));
        assert!(md.contains("- issue: file does not exist"));
        assert!(md.contains("kept `210000`, discarded `200000`"));
        assert!(!md.contains("Possible Duplicates"));
    }

    #[tokio::test]
    async fn report_files_land_in_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = write_report_files(dir.path(), &sample()).await.unwrap();
        assert_eq!(run_dir, dir.path().join("run-1"));

        let raw = std::fs::read_to_string(run_dir.join(REPORT_JSON)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["counts_after"]["jobs"], 0);
        assert_eq!(json["sources"][0]["status"], "missing");
        assert!(run_dir.join(SUMMARY_MD).exists());
    }
}
