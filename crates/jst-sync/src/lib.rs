//! Consolidation pipeline: read legacy trackers, classify, map, merge, write, report.

pub mod export;
pub mod merge;
pub mod report;
pub mod review;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jst_adapters::{classify_table, map_table, ConsolidationRules, StagedBatch};
use jst_core::{Application, Contact, Job, Metric, ProfileEntry, Response, TargetTable};
use jst_storage::{
    read_source, DuplicateGroup, KeyIndexCheck, RunStart, SnapshotStore, SourceStatus,
    UnifiedBatch, UnifiedStore, WriteSummary,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::export::export_parquet_snapshots;
use crate::merge::{merge_records, MergeOutcome, MergeStats, RecordedConflict};
use crate::report::{
    write_report_files, ConsolidationReport, SourceReport, TableReport, REPORT_JSON, SUMMARY_MD,
};
use crate::review::{NearDuplicate, NearDuplicateDetector, ReviewConfig, ReviewKey};

pub const CRATE_NAME: &str = "jst-sync";

/// Legacy tracker databases looked for when nothing else is configured.
pub const DEFAULT_SOURCES: &[&str] = &[
    "UNIFIED_AI_JOBS.db",
    "job_applications.db",
    "principal_jobs_400k.db",
    "data/job_tracker.db",
    "data/applications.db",
    "data/responses.db",
    "data/contacts.db",
];

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub target_db: PathBuf,
    /// Processing order; later sources win last-write-wins ties.
    pub sources: Vec<PathBuf>,
    pub rules_path: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub review_threshold: f64,
    pub dry_run: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            target_db: PathBuf::from("./unified_platform.db"),
            sources: DEFAULT_SOURCES.iter().map(PathBuf::from).collect(),
            rules_path: None,
            reports_dir: PathBuf::from("./reports"),
            backup_dir: PathBuf::from("./backups"),
            review_threshold: ReviewConfig::default().review_threshold,
            dry_run: false,
        }
    }
}

impl ConsolidationConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            target_db: std::env::var("JST_TARGET_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.target_db),
            sources: std::env::var("JST_SOURCES")
                .ok()
                .map(|v| parse_source_list(&v))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.sources),
            rules_path: std::env::var("JST_RULES").ok().map(PathBuf::from),
            reports_dir: std::env::var("JST_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            backup_dir: std::env::var("JST_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
            review_threshold: std::env::var("JST_REVIEW_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.review_threshold),
            dry_run: false,
        }
    }

    pub fn load_rules(&self) -> Result<ConsolidationRules> {
        load_rules(self.rules_path.as_deref())
    }
}

pub fn parse_source_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub fn load_rules(path: Option<&Path>) -> Result<ConsolidationRules> {
    match path {
        Some(path) => ConsolidationRules::from_yaml_path(path)
            .with_context(|| format!("loading rules from {}", path.display())),
        None => ConsolidationRules::builtin().context("loading built-in rules"),
    }
}

/// Read, classify and map every source in order. Unreadable sources and
/// unclassified tables are reported, never fatal.
pub async fn stage_sources(
    rules: &ConsolidationRules,
    sources: &[PathBuf],
) -> (Vec<SourceReport>, StagedBatch) {
    let mut reports = Vec::with_capacity(sources.len());
    let mut batch = StagedBatch::default();

    for path in sources {
        let outcome = read_source(path).await;
        let mut tables = Vec::with_capacity(outcome.tables.len());
        for table in &outcome.tables {
            let columns = table.column_names();
            let classification = classify_table(rules, &outcome.label, &table.name, &columns);
            let mut entry = TableReport {
                table: table.name.clone(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                row_count: table.rows.len(),
                category: classification.category,
                reason: classification.reason,
                rows_mapped: 0,
                rejections: Vec::new(),
                column_map: BTreeMap::new(),
                dropped_columns: Vec::new(),
            };
            match classification.category {
                Some(category) => {
                    let mapped = map_table(rules, &outcome.label, table, category, &mut batch);
                    info!(
                        source = %outcome.label,
                        table = %table.name,
                        %category,
                        mapped = mapped.rows_mapped,
                        rejected = mapped.rejections.len(),
                        "mapped legacy table"
                    );
                    entry.rows_mapped = mapped.rows_mapped;
                    entry.rejections = mapped.rejections;
                    entry.column_map = mapped.column_map;
                    entry.dropped_columns = mapped.dropped_columns;
                }
                None => {
                    warn!(
                        source = %outcome.label,
                        table = %table.name,
                        "unclassified table skipped"
                    );
                }
            }
            tables.push(entry);
        }

        reports.push(SourceReport {
            path: outcome.path.display().to_string(),
            label: outcome.label.clone(),
            sha256: outcome.sha256.clone(),
            status: outcome.status,
            issues: outcome.issues.clone(),
            tables,
        });
    }

    (reports, batch)
}

/// Every staged table after exact-key merging.
#[derive(Debug, Clone)]
pub struct MergedBatch {
    pub jobs: MergeOutcome<Job>,
    pub applications: MergeOutcome<Application>,
    pub responses: MergeOutcome<Response>,
    pub contacts: MergeOutcome<Contact>,
    pub metrics: MergeOutcome<Metric>,
    pub profile: MergeOutcome<ProfileEntry>,
}

impl MergedBatch {
    pub fn from_staged(batch: StagedBatch) -> Self {
        Self {
            jobs: merge_records(batch.jobs),
            applications: merge_records(batch.applications),
            responses: merge_records(batch.responses),
            contacts: merge_records(batch.contacts),
            metrics: merge_records(batch.metrics),
            profile: merge_records(batch.profile),
        }
    }

    pub fn stats(&self) -> BTreeMap<TargetTable, MergeStats> {
        BTreeMap::from([
            (TargetTable::Jobs, self.jobs.stats),
            (TargetTable::Applications, self.applications.stats),
            (TargetTable::Responses, self.responses.stats),
            (TargetTable::Contacts, self.contacts.stats),
            (TargetTable::Metrics, self.metrics.stats),
            (TargetTable::Profile, self.profile.stats),
        ])
    }

    pub fn conflicts(&self) -> Vec<RecordedConflict> {
        [
            &self.jobs.conflicts,
            &self.applications.conflicts,
            &self.responses.conflicts,
            &self.contacts.conflicts,
            &self.metrics.conflicts,
            &self.profile.conflicts,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    pub fn to_unified(&self) -> UnifiedBatch {
        UnifiedBatch {
            jobs: self.jobs.records(),
            applications: self.applications.records(),
            responses: self.responses.records(),
            contacts: self.contacts.records(),
            metrics: self.metrics.records(),
            profile: self.profile.records(),
        }
    }

    /// Company-scoped tables scanned for near duplicates.
    pub fn review_keys(&self) -> Vec<(TargetTable, Vec<ReviewKey>)> {
        vec![
            (
                TargetTable::Jobs,
                self.jobs
                    .merged
                    .iter()
                    .map(|m| ReviewKey {
                        company: m.record.company.clone(),
                        label: m.record.title.clone(),
                    })
                    .collect(),
            ),
            (
                TargetTable::Applications,
                self.applications
                    .merged
                    .iter()
                    .map(|m| ReviewKey {
                        company: m.record.company.clone(),
                        label: m.record.position.clone(),
                    })
                    .collect(),
            ),
            (
                TargetTable::Contacts,
                self.contacts
                    .merged
                    .iter()
                    .map(|m| ReviewKey {
                        company: m.record.company.clone(),
                        label: m.record.name.clone(),
                    })
                    .collect(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
struct SourceFingerprint<'a> {
    path: &'a str,
    sha256: Option<&'a str>,
    status: SourceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub sources_read: usize,
    pub sources_skipped: usize,
    pub staged_rows: usize,
    pub merged_rows: usize,
    pub rows_written: usize,
    pub conflicts: usize,
    pub review_items: usize,
    pub counts_after: Option<BTreeMap<TargetTable, i64>>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct ConsolidationPipeline {
    config: ConsolidationConfig,
    rules: ConsolidationRules,
    snapshots: SnapshotStore,
    detector: NearDuplicateDetector,
}

impl ConsolidationPipeline {
    pub fn new(config: ConsolidationConfig) -> Result<Self> {
        let rules = config.load_rules()?;
        Ok(Self::with_rules(config, rules))
    }

    pub fn with_rules(config: ConsolidationConfig, rules: ConsolidationRules) -> Self {
        let snapshots = SnapshotStore::new(config.backup_dir.clone());
        let detector = NearDuplicateDetector::new(ReviewConfig {
            review_threshold: config.review_threshold,
        });
        Self {
            config,
            rules,
            snapshots,
            detector,
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<ConsolidationSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        info!(
            %run_id,
            sources = self.config.sources.len(),
            dry_run = self.config.dry_run,
            "consolidation started"
        );

        let (sources, staged) = stage_sources(&self.rules, &self.config.sources).await;
        let staged_rows = staged.len();
        let merged = MergedBatch::from_staged(staged);
        let unified = merged.to_unified();
        let conflicts = merged.conflicts();
        let review = self.review(&merged);

        let mut backup_path = None;
        let mut counts_before = None;
        let mut counts_after = None;
        let mut write: Option<WriteSummary> = None;

        if self.config.dry_run {
            info!(%run_id, "dry run; target left untouched");
        } else {
            let target = &self.config.target_db;
            let exists = tokio::fs::try_exists(target)
                .await
                .with_context(|| format!("checking {}", target.display()))?;
            if exists {
                let label = target
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unified".to_string());
                let stored = self.snapshots.store_file(started_at, &label, target).await?;
                info!(
                    path = %stored.absolute_path.display(),
                    deduplicated = stored.deduplicated,
                    "target snapshot stored"
                );
                backup_path = Some(stored.absolute_path.display().to_string());
            }

            let store = UnifiedStore::open(target)
                .await
                .with_context(|| format!("opening target {}", target.display()))?;
            counts_before = Some(store.table_counts().await.context("counting target rows")?);

            let fingerprints: Vec<SourceFingerprint<'_>> = sources
                .iter()
                .map(|s| SourceFingerprint {
                    path: &s.path,
                    sha256: s.sha256.as_deref(),
                    status: s.status,
                })
                .collect();
            let run = RunStart {
                run_id: run_id.clone(),
                started_at,
                sources_json: serde_json::to_string(&fingerprints)
                    .context("serializing source fingerprints")?,
            };
            let summary = store
                .write_batch(&unified, &run)
                .await
                .context("writing unified batch")?;

            counts_after = Some(store.table_counts().await.context("counting target rows")?);
            store.close().await;
            write = Some(summary);
        }

        let finished_at = Utc::now();
        let report = ConsolidationReport {
            run_id: run_id.clone(),
            started_at,
            finished_at,
            target_db: self.config.target_db.display().to_string(),
            dry_run: self.config.dry_run,
            backup_path,
            counts_before: counts_before.clone(),
            counts_after: counts_after.clone(),
            write: write.clone(),
            sources,
            merge: merged.stats(),
            conflicts,
            review,
        };
        let reports_dir = write_report_files(&self.config.reports_dir, &report).await?;
        let manifest_path = export_parquet_snapshots(
            &reports_dir,
            &merged.jobs.merged,
            counts_before.as_ref(),
            counts_after.as_ref(),
        )?;

        let sources_read = report
            .sources
            .iter()
            .filter(|s| s.status == SourceStatus::Read)
            .count();
        let summary = ConsolidationSummary {
            run_id,
            started_at,
            finished_at,
            dry_run: self.config.dry_run,
            sources_read,
            sources_skipped: report.sources.len() - sources_read,
            staged_rows,
            merged_rows: unified.len(),
            rows_written: write.map(|w| w.rows_written()).unwrap_or(0),
            conflicts: report.conflicts.len(),
            review_items: report.review.len(),
            counts_after,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        info!(
            run_id = %summary.run_id,
            merged = summary.merged_rows,
            written = summary.rows_written,
            "consolidation finished"
        );
        Ok(summary)
    }

    fn review(&self, merged: &MergedBatch) -> Vec<NearDuplicate> {
        merged
            .review_keys()
            .into_iter()
            .flat_map(|(table, keys)| self.detector.scan(table, &keys))
            .collect()
    }
}

pub async fn run_consolidation_from_env() -> Result<ConsolidationSummary> {
    ConsolidationPipeline::new(ConsolidationConfig::from_env())?
        .run_once()
        .await
}

/// Creates the target (if needed) and applies the schema.
pub async fn init_target(path: &Path) -> Result<BTreeMap<TargetTable, i64>> {
    let store = UnifiedStore::open(path)
        .await
        .with_context(|| format!("initializing {}", path.display()))?;
    let counts = store.table_counts().await.context("counting target rows")?;
    store.close().await;
    Ok(counts)
}

/// Reads and classifies sources without writing anything.
pub async fn analyze_sources(rules: &ConsolidationRules, sources: &[PathBuf]) -> Vec<SourceReport> {
    stage_sources(rules, sources).await.0
}

pub fn render_analysis_markdown(sources: &[SourceReport]) -> String {
    let mut lines = vec!["# Legacy Schema Analysis".to_string(), String::new()];
    for source in sources {
        lines.push(format!("## {} ({:?})", source.label, source.status));
        lines.push(format!("- path: `{}`", source.path));
        for issue in &source.issues {
            lines.push(format!("- issue: {}", issue.message));
        }
        for table in &source.tables {
            let category = table
                .category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unclassified".to_string());
            lines.push(String::new());
            lines.push(format!("### `{}` -> {}", table.table, category));
            lines.push(format!("- rows: {}", table.row_count));
            lines.push(format!("- columns: {}", table.columns.join(", ")));
            if !table.column_map.is_empty() {
                let mapped = table
                    .column_map
                    .iter()
                    .map(|(target, legacy)| {
                        if target.eq_ignore_ascii_case(legacy) {
                            target.clone()
                        } else {
                            format!("{legacy} -> {target}")
                        }
                    })
                    .collect::<Vec<_>>();
                lines.push(format!("- mapped: {}", mapped.join(", ")));
            }
            if !table.dropped_columns.is_empty() {
                lines.push(format!("- dropped: {}", table.dropped_columns.join(", ")));
            }
            if !table.rejections.is_empty() {
                lines.push(format!("- rejected rows: {}", table.rejections.len()));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub target_db: String,
    pub key_index: KeyIndexCheck,
    pub duplicates: Vec<DuplicateGroup>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.key_index.is_satisfied() && self.duplicates.is_empty()
    }
}

/// Checks the jobs key index and looks for duplicate key groups in every table.
pub async fn verify_target(path: &Path) -> Result<VerifyReport> {
    if !tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        bail!("target database {} does not exist", path.display());
    }
    let store = UnifiedStore::open_existing(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let key_index = store
        .check_key_index(TargetTable::Jobs)
        .await
        .context("inspecting jobs indexes")?;
    let duplicates = store
        .duplicate_groups()
        .await
        .context("looking for duplicate keys")?;
    store.close().await;

    Ok(VerifyReport {
        target_db: path.display().to_string(),
        key_index,
        duplicates,
    })
}

/// Markdown index over the latest `runs` report directories.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(REPORT_JSON).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Consolidation Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join(REPORT_JSON);
        let summary_path = dir.path().join(SUMMARY_MD);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;
        let array_len = |field: &str| {
            value
                .get(field)
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0)
        };
        let finished = value
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let dry_run = value
            .get("dry_run")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        if dry_run {
            lines.push("- dry run".to_string());
        }
        if let Some(counts) = value.get("counts_after").and_then(|v| v.as_object()) {
            let rendered = counts
                .iter()
                .map(|(table, n)| format!("{table}={n}"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- rows after: {rendered}"));
        }
        lines.push(format!("- sources: {}", array_len("sources")));
        lines.push(format!("- conflicts: {}", array_len("conflicts")));
        lines.push(format!("- review items: {}", array_len("review")));
        lines.push(format!("- report: `{}`", report_path.display()));
        if summary_path.exists() {
            lines.push(format!("- summary: `{}`", summary_path.display()));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jst_core::{SourceRef, Staged};

    fn staged_job(db: &str, company: &str, title: &str) -> Staged<Job> {
        Staged {
            record: Job::new(company, title),
            source: SourceRef {
                database: db.into(),
                table: "jobs".into(),
                row_index: 0,
            },
        }
    }

    #[test]
    fn source_list_parsing_skips_blanks() {
        let list = parse_source_list(" a.db, ,data/b.db,");
        assert_eq!(list, vec![PathBuf::from("a.db"), PathBuf::from("data/b.db")]);
    }

    #[test]
    fn defaults_cover_known_legacy_files() {
        let config = ConsolidationConfig::default();
        assert_eq!(config.sources.len(), 7);
        assert_eq!(config.target_db, PathBuf::from("./unified_platform.db"));
        assert!((config.review_threshold - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn merged_batch_flags_suffix_variants_for_review() {
        let mut batch = StagedBatch::default();
        batch.jobs.push(staged_job("a", "OpenAI", "ML Engineer"));
        batch.jobs.push(staged_job("b", "OpenAI", "ML Engineer"));
        batch.jobs.push(staged_job("c", "OpenAI Inc.", "ML Engineer"));

        let merged = MergedBatch::from_staged(batch);
        assert_eq!(merged.to_unified().jobs.len(), 2);
        assert_eq!(merged.stats()[&TargetTable::Jobs].folded, 1);

        let pipeline = ConsolidationPipeline::with_rules(
            ConsolidationConfig::default(),
            ConsolidationRules::builtin().unwrap(),
        );
        let review = pipeline.review(&merged);
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].table, TargetTable::Jobs);
    }

    #[test]
    fn report_index_requires_reports_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(report_recent_markdown(3, &dir.path().join("missing")).is_err());
        let md = report_recent_markdown(3, dir.path()).unwrap();
        assert!(md.starts_with("# Consolidation Runs"));
    }
}
