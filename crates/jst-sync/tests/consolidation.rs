use std::path::{Path, PathBuf};

use jst_core::TargetTable;
use jst_sync::{
    report_recent_markdown, verify_target, ConsolidationConfig, ConsolidationPipeline,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use tempfile::TempDir;

async fn seed(path: &Path, sql: &str) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::raw_sql(sql).execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();
}

async fn open_target(path: &Path) -> SqliteConnection {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    SqliteConnection::connect_with(&options).await.unwrap()
}

fn config(dir: &TempDir, sources: Vec<PathBuf>) -> ConsolidationConfig {
    ConsolidationConfig {
        target_db: dir.path().join("unified_platform.db"),
        sources,
        rules_path: None,
        reports_dir: dir.path().join("reports"),
        backup_dir: dir.path().join("backups"),
        review_threshold: 0.90,
        dry_run: false,
    }
}

/// Two legacy trackers that both know the OpenAI posting, under different column names.
async fn openai_sources(dir: &TempDir) -> Vec<PathBuf> {
    let unified_ai = dir.path().join("UNIFIED_AI_JOBS.db");
    seed(
        &unified_ai,
        "CREATE TABLE jobs (
           id INTEGER PRIMARY KEY, company TEXT, title TEXT, salary_min INTEGER, location TEXT
         );
         INSERT INTO jobs (company, title, salary_min, location)
           VALUES ('OpenAI', 'ML Engineer', 200000, 'San Francisco');
         INSERT INTO jobs (company, title, salary_min)
           VALUES ('Anthropic', 'Research Engineer', 250000);",
    )
    .await;

    let principal = dir.path().join("principal_jobs_400k.db");
    seed(
        &principal,
        "CREATE TABLE jobs (
           job_id INTEGER PRIMARY KEY, company_name TEXT, job_title TEXT, min_salary INTEGER,
           notes TEXT
         );
         INSERT INTO jobs (company_name, job_title, min_salary, notes)
           VALUES ('OpenAI', 'ML Engineer', 210000, 'principal track');",
    )
    .await;

    vec![unified_ai, principal]
}

#[tokio::test]
async fn openai_posting_from_two_sources_becomes_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let sources = openai_sources(&dir).await;
    let pipeline = ConsolidationPipeline::new(config(&dir, sources)).unwrap();

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.sources_read, 2);
    assert_eq!(summary.staged_rows, 3);
    assert_eq!(summary.merged_rows, 2);
    assert_eq!(summary.conflicts, 1);

    let mut conn = open_target(&dir.path().join("unified_platform.db")).await;
    let rows = sqlx::query(
        "SELECT salary_min, location FROM jobs WHERE company = 'OpenAI' AND title = 'ML Engineer'",
    )
    .fetch_all(&mut conn)
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i64, _>("salary_min"), 210_000);
    assert_eq!(rows[0].get::<Option<String>, _>("location").as_deref(), Some("San Francisco"));

    let report_path = Path::new(&summary.reports_dir).join("consolidation_report.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(report["conflicts"][0]["field"], "salary_min");
    assert_eq!(report["conflicts"][0]["kept"], "210000");
    assert_eq!(report["conflicts"][0]["resolution"], "last_write_wins");
    assert_eq!(report["sources"][1]["tables"][0]["dropped_columns"][0], "notes");
    assert!(Path::new(&summary.parquet_manifest).exists());
}

#[tokio::test]
async fn second_run_over_unchanged_sources_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let sources = openai_sources(&dir).await;
    let applications = dir.path().join("job_applications.db");
    seed(
        &applications,
        "CREATE TABLE applications (
           id INTEGER PRIMARY KEY, company TEXT, position TEXT, status TEXT
         );
         INSERT INTO applications (company, position, status)
           VALUES ('Cohere', 'Staff MLE', 'applied');",
    )
    .await;
    let mut all = sources;
    all.push(applications);

    let pipeline = ConsolidationPipeline::new(config(&dir, all)).unwrap();
    let first = pipeline.run_once().await.unwrap();
    let second = pipeline.run_once().await.unwrap();

    let after_first = first.counts_after.unwrap();
    let after_second = second.counts_after.unwrap();
    assert_eq!(after_first, after_second);
    assert_eq!(after_second[&TargetTable::Jobs], 2);
    assert_eq!(after_second[&TargetTable::Applications], 1);

    let mut conn = open_target(&dir.path().join("unified_platform.db")).await;
    let runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM consolidation_runs")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(runs, 2);

    // The second run found an existing target and backed it up first.
    let backups = dir.path().join("backups");
    assert!(backups.exists());
}

#[tokio::test]
async fn missing_sources_are_skipped_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut sources = openai_sources(&dir).await;
    sources.insert(0, dir.path().join("data").join("contacts.db"));

    let summary = ConsolidationPipeline::new(config(&dir, sources))
        .unwrap()
        .run_once()
        .await
        .unwrap();
    assert_eq!(summary.sources_read, 2);
    assert_eq!(summary.sources_skipped, 1);
    assert_eq!(summary.merged_rows, 2);
    assert!(!dir.path().join("data").join("contacts.db").exists());

    let markdown =
        std::fs::read_to_string(Path::new(&summary.reports_dir).join("summary.md")).unwrap();
    assert!(markdown.contains("### contacts (Missing)"));
}

#[tokio::test]
async fn dry_run_leaves_no_target_behind() {
    let dir = tempfile::tempdir().unwrap();
    let sources = openai_sources(&dir).await;
    let mut cfg = config(&dir, sources);
    cfg.dry_run = true;

    let summary = ConsolidationPipeline::new(cfg).unwrap().run_once().await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.rows_written, 0);
    assert_eq!(summary.merged_rows, 2);
    assert!(!dir.path().join("unified_platform.db").exists());
    assert!(Path::new(&summary.reports_dir).join("summary.md").exists());
}

#[tokio::test]
async fn applied_flag_and_date_survive_consolidation() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = dir.path().join("job_tracker.db");
    seed(
        &tracker,
        "CREATE TABLE job_postings (
           id INTEGER PRIMARY KEY, company TEXT, job_title TEXT, applied TEXT, date_applied TEXT
         );
         INSERT INTO job_postings (company, job_title, applied, date_applied)
           VALUES ('Scale AI', 'Applied Scientist', 'yes', '2024-03-01T09:30:00Z');",
    )
    .await;

    ConsolidationPipeline::new(config(&dir, vec![tracker]))
        .unwrap()
        .run_once()
        .await
        .unwrap();

    let mut conn = open_target(&dir.path().join("unified_platform.db")).await;
    let row = sqlx::query("SELECT applied, applied_date FROM jobs WHERE company = 'Scale AI'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("applied"), 1);
    assert_eq!(row.get::<String, _>("applied_date"), "2024-03-01T09:30:00Z");
}

#[tokio::test]
async fn verify_and_report_index_after_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let sources = openai_sources(&dir).await;
    let cfg = config(&dir, sources);
    let target = cfg.target_db.clone();
    let reports = cfg.reports_dir.clone();

    assert!(verify_target(&target).await.is_err());

    let summary = ConsolidationPipeline::new(cfg).unwrap().run_once().await.unwrap();
    let verified = verify_target(&target).await.unwrap();
    assert!(verified.is_ok());
    assert!(verified.key_index.index_name.is_some());
    assert!(verified.duplicates.is_empty());

    let index = report_recent_markdown(5, &reports).unwrap();
    assert!(index.contains(&format!("## Run `{}`", summary.run_id)));
    assert!(index.contains("conflicts: 1"));
}
