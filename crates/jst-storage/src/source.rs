//! Read-only introspection of legacy tracker databases.

use std::path::{Path, PathBuf};

use jst_core::SqlValue;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Row, TypeInfo, ValueRef};
use tracing::{info, info_span, warn, Instrument};

use crate::{file_sha256, quote_identifier, validate_identifier, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl SourceTable {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Read,
    Missing,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceIssue {
    pub table: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReadOutcome {
    pub path: PathBuf,
    /// File stem, used as the database name in provenance and overrides.
    pub label: String,
    pub sha256: Option<String>,
    pub status: SourceStatus,
    pub tables: Vec<SourceTable>,
    pub issues: Vec<SourceIssue>,
}

impl SourceReadOutcome {
    fn new(path: &Path) -> Self {
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path: path.to_path_buf(),
            label,
            sha256: None,
            status: SourceStatus::Read,
            tables: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn fail(mut self, status: SourceStatus, message: String) -> Self {
        warn!(path = %self.path.display(), %message, "skipping legacy database");
        self.status = status;
        self.issues.push(SourceIssue {
            table: None,
            message,
        });
        self
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

/// Reads every user table of a legacy database. Never fails: a missing file,
/// an unreadable database, or a broken table is logged and recorded as an issue.
pub async fn read_source(path: &Path) -> SourceReadOutcome {
    let span = info_span!("read_source", path = %path.display());
    read_source_inner(path).instrument(span).await
}

async fn read_source_inner(path: &Path) -> SourceReadOutcome {
    let mut outcome = SourceReadOutcome::new(path);

    match tokio::fs::try_exists(path).await {
        Ok(true) => {}
        Ok(false) => return outcome.fail(SourceStatus::Missing, "file does not exist".to_string()),
        Err(err) => return outcome.fail(SourceStatus::Failed, format!("checking file: {err}")),
    }

    match file_sha256(path).await {
        Ok(hash) => outcome.sha256 = Some(hash),
        Err(err) => return outcome.fail(SourceStatus::Failed, format!("{err:#}")),
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false);
    let mut conn = match SqliteConnection::connect_with(&options).await {
        Ok(conn) => conn,
        Err(err) => return outcome.fail(SourceStatus::Failed, format!("opening database: {err}")),
    };

    let table_names = match list_tables(&mut conn).await {
        Ok(names) => names,
        Err(err) => {
            let _ = conn.close().await;
            return outcome.fail(SourceStatus::Failed, format!("listing tables: {err}"));
        }
    };

    for name in table_names {
        match read_table(&mut conn, &name).await {
            Ok(table) => outcome.tables.push(table),
            Err(err) => {
                warn!(table = %name, error = %err, "skipping unreadable table");
                outcome.issues.push(SourceIssue {
                    table: Some(name),
                    message: err.to_string(),
                });
            }
        }
    }
    let _ = conn.close().await;

    info!(
        tables = outcome.tables.len(),
        rows = outcome.row_count(),
        issues = outcome.issues.len(),
        "read legacy database"
    );
    outcome
}

async fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
}

async fn read_table(conn: &mut SqliteConnection, name: &str) -> Result<SourceTable, StorageError> {
    validate_identifier(name)?;
    let quoted = quote_identifier(name)?;

    let pragma = format!("PRAGMA table_info({quoted})");
    let info = sqlx::query(&pragma).fetch_all(&mut *conn).await?;
    let columns = info
        .iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("name")?,
                declared_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                primary_key: row.try_get::<i64, _>("pk")? != 0,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    let select = format!("SELECT * FROM {quoted}");
    let rows = sqlx::query(&select).fetch_all(&mut *conn).await?;
    let rows = rows
        .iter()
        .map(decode_row)
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    Ok(SourceTable {
        name: name.to_string(),
        columns,
        rows,
    })
}

/// Decodes by runtime storage class, not declared column type: legacy tables
/// routinely keep text in INTEGER columns and numbers in TEXT ones.
fn decode_row(row: &SqliteRow) -> Result<Vec<SqlValue>, sqlx::Error> {
    (0..row.len())
        .map(|idx| {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(SqlValue::Null);
            }
            let storage_class = raw.type_info().name().to_string();
            let value = match storage_class.as_str() {
                "INTEGER" => SqlValue::Integer(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" => SqlValue::Real(row.try_get_unchecked::<f64, _>(idx)?),
                "BLOB" => SqlValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                _ => match row.try_get_unchecked::<String, _>(idx) {
                    Ok(text) => SqlValue::Text(text),
                    // SQLite does not validate TEXT; keep the cell rather than lose the table.
                    Err(_) => {
                        let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                        SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                    }
                },
            };
            Ok(value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_db(path: &Path, sql: &str) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.expect("create db");
        sqlx::raw_sql(sql).execute(&mut conn).await.expect("seed db");
        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn reads_tables_columns_and_dynamic_values() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("job_applications.db");
        create_db(
            &path,
            "CREATE TABLE applications (
               id INTEGER PRIMARY KEY, company TEXT NOT NULL, salary INTEGER, score REAL, notes BLOB
             );
             INSERT INTO applications (company, salary, score, notes)
               VALUES ('OpenAI', '200k', 0.9, x'0102');
             INSERT INTO applications (company, salary, score, notes)
               VALUES ('Anthropic', 250000, NULL, NULL);",
        )
        .await;

        let outcome = read_source(&path).await;
        assert_eq!(outcome.status, SourceStatus::Read);
        assert_eq!(outcome.label, "job_applications");
        assert!(outcome.sha256.is_some());
        assert!(outcome.issues.is_empty());

        let table = &outcome.tables[0];
        assert_eq!(table.name, "applications");
        assert_eq!(table.column_names(), vec!["id", "company", "salary", "score", "notes"]);
        assert!(table.columns[0].primary_key);
        assert!(table.columns[1].not_null);
        assert_eq!(table.column_index("COMPANY"), Some(1));

        assert_eq!(table.rows[0][1], SqlValue::Text("OpenAI".into()));
        assert_eq!(table.rows[0][2], SqlValue::Text("200k".into()));
        assert_eq!(table.rows[0][3], SqlValue::Real(0.9));
        assert_eq!(table.rows[0][4], SqlValue::Blob(vec![1, 2]));
        assert_eq!(table.rows[1][2], SqlValue::Integer(250_000));
        assert_eq!(table.rows[1][3], SqlValue::Null);
    }

    #[tokio::test]
    async fn invalid_utf8_text_is_kept_lossily() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("job_tracker.db");
        create_db(
            &path,
            "CREATE TABLE jobs (company TEXT, title TEXT);
             INSERT INTO jobs VALUES ('OpenAI', 'ML Engineer');
             INSERT INTO jobs VALUES ('Cohere', CAST(x'4d4cff' AS TEXT));",
        )
        .await;

        let outcome = read_source(&path).await;
        assert_eq!(outcome.status, SourceStatus::Read);
        assert!(outcome.issues.is_empty(), "{:?}", outcome.issues);

        let table = &outcome.tables[0];
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1], SqlValue::Text("ML Engineer".into()));
        assert_eq!(table.rows[1][1], SqlValue::Text("ML\u{fffd}".into()));
    }

    #[tokio::test]
    async fn missing_file_is_reported_not_created() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("principal_jobs_400k.db");

        let outcome = read_source(&path).await;
        assert_eq!(outcome.status, SourceStatus::Missing);
        assert!(outcome.tables.is_empty());
        assert_eq!(outcome.issues.len(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn non_database_file_fails_softly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("notes.db");
        std::fs::write(&path, b"this is not sqlite, just some notes").expect("write");

        let outcome = read_source(&path).await;
        assert_eq!(outcome.status, SourceStatus::Failed);
        assert!(outcome.tables.is_empty());
    }

    #[tokio::test]
    async fn oddly_named_tables_are_skipped_with_an_issue() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("UNIFIED_AI_JOBS.db");
        create_db(
            &path,
            "CREATE TABLE \"job leads\" (company TEXT);
             CREATE TABLE jobs (company TEXT, title TEXT);
             INSERT INTO jobs VALUES ('OpenAI', 'ML Engineer');",
        )
        .await;

        let outcome = read_source(&path).await;
        assert_eq!(outcome.status, SourceStatus::Read);
        assert_eq!(outcome.tables.len(), 1);
        assert_eq!(outcome.tables[0].name, "jobs");
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].table.as_deref(), Some("job leads"));
    }
}
