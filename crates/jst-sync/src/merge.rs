//! Exact-key record merging across legacy sources.

use std::collections::HashMap;

use jst_core::{parse_timestamp, SourceRef, Staged, TargetTable, UnifiedRecord};
use serde::Serialize;

/// A record after folding every staged row that shares its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Merged<T> {
    pub record: T,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Both rows carried a parseable timestamp; the newer row's value was kept.
    NewerTimestamp,
    /// No usable timestamps (or equal ones); the row processed later won.
    LastWriteWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedConflict {
    pub table: TargetTable,
    pub key: String,
    pub field: String,
    pub kept: String,
    pub discarded: String,
    pub resolution: Resolution,
    pub incoming: SourceRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub staged: usize,
    pub merged: usize,
    pub folded: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome<T> {
    pub merged: Vec<Merged<T>>,
    pub conflicts: Vec<RecordedConflict>,
    pub stats: MergeStats,
}

impl<T> MergeOutcome<T> {
    pub fn records(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.merged.iter().map(|m| m.record.clone()).collect()
    }
}

pub fn display_key(key: &[Option<String>]) -> String {
    key.iter()
        .map(|part| part.as_deref().unwrap_or("<null>"))
        .collect::<Vec<_>>()
        .join(" / ")
}

/// Decides whether the incoming row's values beat the current ones.
fn precedence(current: Option<&str>, incoming: Option<&str>) -> (bool, Resolution) {
    let parsed = (
        current.and_then(parse_timestamp),
        incoming.and_then(parse_timestamp),
    );
    match parsed {
        (Some(cur), Some(inc)) if inc != cur => (inc > cur, Resolution::NewerTimestamp),
        _ => (true, Resolution::LastWriteWins),
    }
}

/// Folds rows with an identical key, in input order. Matching is exact:
/// "OpenAI" and "OpenAI Inc." stay separate records.
pub fn merge_records<T: UnifiedRecord>(items: Vec<Staged<T>>) -> MergeOutcome<T> {
    let mut index: HashMap<Vec<Option<String>>, usize> = HashMap::new();
    let mut merged: Vec<Merged<T>> = Vec::new();
    let mut conflicts = Vec::new();
    let mut stats = MergeStats {
        staged: items.len(),
        ..Default::default()
    };

    for Staged { record, source } in items {
        let key = record.key();
        let pos = match index.get(&key).copied() {
            Some(pos) => pos,
            None => {
                index.insert(key, merged.len());
                merged.push(Merged {
                    record,
                    sources: vec![source],
                });
                continue;
            }
        };

        let current = &mut merged[pos];
        let (incoming_wins, resolution) =
            precedence(current.record.timestamp(), record.timestamp());
        let field_conflicts = current.record.merge_from(record, incoming_wins);
        let key_text = display_key(&key);
        conflicts.extend(field_conflicts.into_iter().map(|c| RecordedConflict {
            table: T::TABLE,
            key: key_text.clone(),
            field: c.field,
            kept: c.kept,
            discarded: c.discarded,
            resolution,
            incoming: source.clone(),
        }));
        current.sources.push(source);
        stats.folded += 1;
    }

    stats.merged = merged.len();
    stats.conflicts = conflicts.len();
    MergeOutcome {
        merged,
        conflicts,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jst_core::{Application, Job};

    fn staged_job(db: &str, row: usize, company: &str, title: &str) -> Staged<Job> {
        Staged {
            record: Job::new(company, title),
            source: SourceRef {
                database: db.into(),
                table: "jobs".into(),
                row_index: row,
            },
        }
    }

    #[test]
    fn last_write_wins_without_timestamps() {
        let mut a = staged_job("UNIFIED_AI_JOBS", 0, "OpenAI", "ML Engineer");
        a.record.salary_min = Some(200_000);
        let mut b = staged_job("principal_jobs_400k", 3, "OpenAI", "ML Engineer");
        b.record.salary_min = Some(210_000);

        let outcome = merge_records(vec![a, b]);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].record.salary_min, Some(210_000));
        assert_eq!(outcome.merged[0].sources.len(), 2);
        assert_eq!(outcome.stats.folded, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].resolution, Resolution::LastWriteWins);
        assert_eq!(outcome.conflicts[0].discarded, "200000");
        assert_eq!(outcome.conflicts[0].key, "OpenAI / ML Engineer");
    }

    #[test]
    fn newer_timestamp_beats_processing_order() {
        let mut newer = staged_job("a", 0, "Anthropic", "Research Engineer");
        newer.record.discovered_date = Some("2024-06-01".into());
        newer.record.location = Some("San Francisco".into());
        let mut older = staged_job("b", 0, "Anthropic", "Research Engineer");
        older.record.discovered_date = Some("2024-01-15 08:00:00".into());
        older.record.location = Some("Remote".into());
        older.record.url = Some("https://anthropic.com/careers".into());

        let outcome = merge_records(vec![newer, older]);
        let job = &outcome.merged[0].record;
        assert_eq!(job.location.as_deref(), Some("San Francisco"));
        assert_eq!(job.discovered_date.as_deref(), Some("2024-06-01"));
        assert_eq!(job.url.as_deref(), Some("https://anthropic.com/careers"));
        assert!(outcome
            .conflicts
            .iter()
            .all(|c| c.resolution == Resolution::NewerTimestamp));
    }

    #[test]
    fn near_identical_company_names_are_not_merged() {
        let outcome = merge_records(vec![
            staged_job("a", 0, "OpenAI", "ML Engineer"),
            staged_job("b", 0, "OpenAI Inc.", "ML Engineer"),
        ]);
        assert_eq!(outcome.merged.len(), 2);
        assert_eq!(outcome.stats.folded, 0);
    }

    #[test]
    fn null_key_parts_match_each_other() {
        let app = Application {
            company: "Cohere".into(),
            position: "Staff MLE".into(),
            applied_date: None,
            method: None,
            resume_version: Some("v3".into()),
            status: Some("applied".into()),
            response_received: false,
        };
        let later = Application {
            status: Some("interviewing".into()),
            response_received: true,
            ..app.clone()
        };
        let src = |row| SourceRef {
            database: "job_applications".into(),
            table: "applications".into(),
            row_index: row,
        };
        let outcome = merge_records(vec![
            Staged { record: app, source: src(0) },
            Staged { record: later, source: src(1) },
        ]);
        assert_eq!(outcome.merged.len(), 1);
        let merged = &outcome.merged[0].record;
        assert_eq!(merged.status.as_deref(), Some("interviewing"));
        assert!(merged.response_received);
        assert_eq!(outcome.conflicts[0].key, "Cohere / Staff MLE / <null>");
    }
}
