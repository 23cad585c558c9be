//! Parquet snapshots of a run: merged jobs and before/after table counts.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use jst_core::{Job, TargetTable};
use jst_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;

use crate::merge::Merged;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the snapshot set under `<run_dir>/snapshots` and returns the manifest path.
pub fn export_parquet_snapshots(
    run_dir: &Path,
    jobs: &[Merged<Job>],
    counts_before: Option<&BTreeMap<TargetTable, i64>>,
    counts_after: Option<&BTreeMap<TargetTable, i64>>,
) -> Result<std::path::PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let jobs_path = snapshot_dir.join("jobs.parquet");
    let counts_path = snapshot_dir.join("table_counts.parquet");
    write_jobs_parquet(&jobs_path, jobs)?;
    write_table_counts_parquet(&counts_path, counts_before, counts_after)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("jobs", run_dir, &jobs_path)?,
            manifest_entry("table_counts", run_dir, &counts_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_jobs_parquet(path: &Path, jobs: &[Merged<Job>]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("salary_min", DataType::Int64, true),
        ArrowField::new("salary_max", DataType::Int64, true),
        ArrowField::new("relevance_score", DataType::Float64, true),
        ArrowField::new("applied", DataType::Boolean, false),
        ArrowField::new("source_rows", DataType::UInt32, false),
    ]));

    let companies = StringArray::from(
        jobs.iter()
            .map(|j| Some(j.record.company.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        jobs.iter()
            .map(|j| Some(j.record.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let locations = StringArray::from(
        jobs.iter()
            .map(|j| j.record.location.as_deref())
            .collect::<Vec<_>>(),
    );
    let salary_min = Int64Array::from(jobs.iter().map(|j| j.record.salary_min).collect::<Vec<_>>());
    let salary_max = Int64Array::from(jobs.iter().map(|j| j.record.salary_max).collect::<Vec<_>>());
    let scores = Float64Array::from(
        jobs.iter()
            .map(|j| j.record.relevance_score)
            .collect::<Vec<_>>(),
    );
    let applied = BooleanArray::from(jobs.iter().map(|j| j.record.applied).collect::<Vec<_>>());
    let source_rows = UInt32Array::from(
        jobs.iter()
            .map(|j| j.sources.len() as u32)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(companies),
            Arc::new(titles),
            Arc::new(locations),
            Arc::new(salary_min),
            Arc::new(salary_max),
            Arc::new(scores),
            Arc::new(applied),
            Arc::new(source_rows),
        ],
    )
    .context("building jobs record batch")?;
    write_parquet(path, batch)
}

fn write_table_counts_parquet(
    path: &Path,
    before: Option<&BTreeMap<TargetTable, i64>>,
    after: Option<&BTreeMap<TargetTable, i64>>,
) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("rows_before", DataType::Int64, true),
        ArrowField::new("rows_after", DataType::Int64, true),
    ]));

    let tables = StringArray::from(
        TargetTable::ALL
            .iter()
            .map(|t| Some(t.as_str()))
            .collect::<Vec<_>>(),
    );
    let rows_before = Int64Array::from(
        TargetTable::ALL
            .iter()
            .map(|t| before.and_then(|c| c.get(t).copied()))
            .collect::<Vec<_>>(),
    );
    let rows_after = Int64Array::from(
        TargetTable::ALL
            .iter()
            .map(|t| after.and_then(|c| c.get(t).copied()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(tables), Arc::new(rows_before), Arc::new(rows_after)],
    )
    .context("building table_counts record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
