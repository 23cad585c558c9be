//! The unified target database: schema migration, batch writer, run ledger
//! and invariant checks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jst_core::{
    Application, Contact, Job, Metric, ProfileEntry, Response, TargetTable, UnifiedRecord,
};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Row, Sqlite};
use tracing::{debug, info};

use crate::StorageError;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// What happens when an incoming row matches an existing row's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Incoming non-null values overwrite, nulls keep the stored value, flags OR.
    Upsert,
    /// The stored row is left untouched.
    Ignore,
}

impl ConflictPolicy {
    pub fn for_table(table: TargetTable) -> Self {
        match table {
            TargetTable::Responses | TargetTable::Metrics => ConflictPolicy::Ignore,
            TargetTable::Jobs
            | TargetTable::Applications
            | TargetTable::Contacts
            | TargetTable::Profile => ConflictPolicy::Upsert,
        }
    }
}

/// Merged rows ready to be persisted, one vector per target table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedBatch {
    pub jobs: Vec<Job>,
    pub applications: Vec<Application>,
    pub responses: Vec<Response>,
    pub contacts: Vec<Contact>,
    pub metrics: Vec<Metric>,
    pub profile: Vec<ProfileEntry>,
}

impl UnifiedBatch {
    pub fn len(&self) -> usize {
        self.jobs.len()
            + self.applications.len()
            + self.responses.len()
            + self.contacts.len()
            + self.metrics.len()
            + self.profile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableWriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub tables: BTreeMap<TargetTable, TableWriteStats>,
}

impl WriteSummary {
    pub fn rows_written(&self) -> usize {
        self.tables.values().map(|s| s.inserted + s.updated).sum()
    }
}

/// Identity of a run, recorded in the ledger when its batch commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStart {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub sources_json: String,
}

/// A committed ledger row. `rows_written` is what the writer inserted or updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_json: String,
    pub rows_written: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyIndexCheck {
    pub table: TargetTable,
    pub expected_columns: Vec<String>,
    /// Name of the unique index covering exactly the expected columns, if any.
    pub index_name: Option<String>,
}

impl KeyIndexCheck {
    pub fn is_satisfied(&self) -> bool {
        self.index_name.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub table: TargetTable,
    pub key: Vec<Option<String>>,
    pub count: i64,
}

#[derive(Debug, Clone)]
enum BindValue {
    Text(Option<String>),
    Int(Option<i64>),
    Real(Option<f64>),
    Flag(bool),
}

/// Column list and bind values of a typed row, in schema order.
trait Writable: UnifiedRecord {
    fn values(&self) -> Vec<(&'static str, BindValue)>;
}

impl Writable for Job {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("company", BindValue::Text(Some(self.company.clone()))),
            ("title", BindValue::Text(Some(self.title.clone()))),
            ("location", BindValue::Text(self.location.clone())),
            ("remote", BindValue::Int(self.remote.map(i64::from))),
            ("salary_min", BindValue::Int(self.salary_min)),
            ("salary_max", BindValue::Int(self.salary_max)),
            ("url", BindValue::Text(self.url.clone())),
            ("source", BindValue::Text(self.source.clone())),
            ("discovered_date", BindValue::Text(self.discovered_date.clone())),
            ("relevance_score", BindValue::Real(self.relevance_score)),
            ("applied", BindValue::Flag(self.applied)),
            ("applied_date", BindValue::Text(self.applied_date.clone())),
        ]
    }
}

impl Writable for Application {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("company", BindValue::Text(Some(self.company.clone()))),
            ("position", BindValue::Text(Some(self.position.clone()))),
            ("applied_date", BindValue::Text(self.applied_date.clone())),
            ("method", BindValue::Text(self.method.clone())),
            ("resume_version", BindValue::Text(self.resume_version.clone())),
            ("status", BindValue::Text(self.status.clone())),
            ("response_received", BindValue::Flag(self.response_received)),
        ]
    }
}

impl Writable for Response {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("company", BindValue::Text(Some(self.company.clone()))),
            ("subject", BindValue::Text(self.subject.clone())),
            ("received_date", BindValue::Text(self.received_date.clone())),
            ("response_type", BindValue::Text(self.response_type.clone())),
            ("content", BindValue::Text(self.content.clone())),
        ]
    }
}

impl Writable for Contact {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("company", BindValue::Text(Some(self.company.clone()))),
            ("name", BindValue::Text(Some(self.name.clone()))),
            ("title", BindValue::Text(self.title.clone())),
            ("email", BindValue::Text(self.email.clone())),
            ("linkedin", BindValue::Text(self.linkedin.clone())),
            ("contacted", BindValue::Flag(self.contacted)),
        ]
    }
}

impl Writable for Metric {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("name", BindValue::Text(Some(self.name.clone()))),
            ("value", BindValue::Real(self.value)),
            ("verified", BindValue::Flag(self.verified)),
            ("recorded_at", BindValue::Text(self.recorded_at.clone())),
        ]
    }
}

impl Writable for ProfileEntry {
    fn values(&self) -> Vec<(&'static str, BindValue)> {
        vec![
            ("field", BindValue::Text(Some(self.field.clone()))),
            ("value", BindValue::Text(self.value.clone())),
        ]
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &BindValue) -> SqliteQuery<'q> {
    match value {
        BindValue::Text(v) => query.bind(v.clone()),
        BindValue::Int(v) => query.bind(*v),
        BindValue::Real(v) => query.bind(*v),
        BindValue::Flag(v) => query.bind(i64::from(*v)),
    }
}

fn bind_key<'q>(mut query: SqliteQuery<'q>, key: &[Option<String>]) -> SqliteQuery<'q> {
    for part in key {
        query = query.bind(part.clone());
    }
    query
}

/// Keys are matched with `IS` so rows whose key has a NULL part still
/// deduplicate, which a plain UNIQUE constraint would not do in SQLite.
async fn write_rows<R: Writable>(
    conn: &mut SqliteConnection,
    rows: &[R],
    policy: ConflictPolicy,
) -> Result<TableWriteStats, sqlx::Error> {
    let table = R::TABLE.as_str();
    let key_columns = R::TABLE.key_columns();
    let lookup = format!(
        "SELECT id FROM {table} WHERE {}",
        key_columns
            .iter()
            .map(|c| format!("{c} IS ?"))
            .collect::<Vec<_>>()
            .join(" AND ")
    );

    let mut stats = TableWriteStats::default();
    for row in rows {
        let key = row.key();
        let existing: Option<i64> = bind_key(sqlx::query(&lookup), &key)
            .fetch_optional(&mut *conn)
            .await?
            .map(|r| r.try_get::<i64, _>("id"))
            .transpose()?;
        let values = row.values();

        match (existing, policy) {
            (None, _) => {
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    values.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", "),
                    vec!["?"; values.len()].join(", ")
                );
                let mut query = sqlx::query(&sql);
                for (_, value) in &values {
                    query = bind_value(query, value);
                }
                query.execute(&mut *conn).await?;
                stats.inserted += 1;
            }
            (Some(_), ConflictPolicy::Ignore) => stats.skipped += 1,
            (Some(id), ConflictPolicy::Upsert) => {
                let updatable = values
                    .iter()
                    .filter(|(c, _)| !key_columns.contains(c))
                    .collect::<Vec<_>>();
                if updatable.is_empty() {
                    stats.skipped += 1;
                    continue;
                }
                let assignments = updatable
                    .iter()
                    .map(|(c, v)| match v {
                        BindValue::Flag(_) => format!("{c} = MAX({c}, ?)"),
                        _ => format!("{c} = COALESCE(?, {c})"),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("UPDATE {table} SET {assignments} WHERE id = ?");
                let mut query = sqlx::query(&sql);
                for (_, value) in &updatable {
                    query = bind_value(query, value);
                }
                query.bind(id).execute(&mut *conn).await?;
                stats.updated += 1;
            }
        }
    }
    debug!(table, ?stats, "wrote table");
    Ok(stats)
}

/// Handle on the unified SQLite database.
#[derive(Debug, Clone)]
pub struct UnifiedStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl UnifiedStore {
    /// Opens (creating if needed) the target and applies the embedded schema.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!(path = %path.display(), "unified database ready");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing target read-only, without touching its schema.
    pub async fn open_existing(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn table_counts(&self) -> Result<BTreeMap<TargetTable, i64>, StorageError> {
        let mut counts = BTreeMap::new();
        for table in TargetTable::ALL {
            let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            counts.insert(table, count);
        }
        Ok(counts)
    }

    /// Persists a whole batch plus its ledger row in one transaction.
    pub async fn write_batch(
        &self,
        batch: &UnifiedBatch,
        run: &RunStart,
    ) -> Result<WriteSummary, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = WriteSummary::default();

        summary.tables.insert(
            TargetTable::Jobs,
            write_rows(&mut *tx, &batch.jobs, ConflictPolicy::for_table(TargetTable::Jobs)).await?,
        );
        summary.tables.insert(
            TargetTable::Applications,
            write_rows(
                &mut *tx,
                &batch.applications,
                ConflictPolicy::for_table(TargetTable::Applications),
            )
            .await?,
        );
        summary.tables.insert(
            TargetTable::Responses,
            write_rows(
                &mut *tx,
                &batch.responses,
                ConflictPolicy::for_table(TargetTable::Responses),
            )
            .await?,
        );
        summary.tables.insert(
            TargetTable::Contacts,
            write_rows(
                &mut *tx,
                &batch.contacts,
                ConflictPolicy::for_table(TargetTable::Contacts),
            )
            .await?,
        );
        summary.tables.insert(
            TargetTable::Metrics,
            write_rows(
                &mut *tx,
                &batch.metrics,
                ConflictPolicy::for_table(TargetTable::Metrics),
            )
            .await?,
        );
        summary.tables.insert(
            TargetTable::Profile,
            write_rows(
                &mut *tx,
                &batch.profile,
                ConflictPolicy::for_table(TargetTable::Profile),
            )
            .await?,
        );

        sqlx::query(
            "INSERT INTO consolidation_runs
               (run_id, started_at, finished_at, sources_json, rows_written)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(run.started_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&run.sources_json)
        .bind(summary.rows_written() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(run_id = %run.run_id, rows = summary.rows_written(), "committed consolidation batch");
        Ok(summary)
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLedgerEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT run_id, started_at, finished_at, sources_json, rows_written
             FROM consolidation_runs ORDER BY finished_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RunLedgerEntry {
                    run_id: row.try_get("run_id")?,
                    started_at: parse_rfc3339(row.try_get("started_at")?)?,
                    finished_at: parse_rfc3339(row.try_get("finished_at")?)?,
                    sources_json: row.try_get("sources_json")?,
                    rows_written: row.try_get("rows_written")?,
                })
            })
            .collect()
    }

    pub async fn load_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let rows = sqlx::query(
            "SELECT company, title, location, remote, salary_min, salary_max, url, source,
                    discovered_date, relevance_score, applied, applied_date
             FROM jobs ORDER BY company, title",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Job {
                    company: row.try_get("company")?,
                    title: row.try_get("title")?,
                    location: row.try_get("location")?,
                    remote: row.try_get::<Option<i64>, _>("remote")?.map(|v| v != 0),
                    salary_min: row.try_get("salary_min")?,
                    salary_max: row.try_get("salary_max")?,
                    url: row.try_get("url")?,
                    source: row.try_get("source")?,
                    discovered_date: row.try_get("discovered_date")?,
                    relevance_score: row.try_get("relevance_score")?,
                    applied: row.try_get::<i64, _>("applied")? != 0,
                    applied_date: row.try_get("applied_date")?,
                })
            })
            .collect()
    }

    /// Looks for a unique index on `table` covering exactly its key columns.
    pub async fn check_key_index(&self, table: TargetTable) -> Result<KeyIndexCheck, StorageError> {
        let expected: Vec<String> = table.key_columns().iter().map(|c| c.to_string()).collect();
        let list_sql = format!("PRAGMA index_list({})", table.as_str());
        let indexes = sqlx::query(&list_sql).fetch_all(&self.pool).await?;

        let mut index_name = None;
        for index in &indexes {
            if index.try_get::<i64, _>("unique")? == 0 {
                continue;
            }
            let name: String = index.try_get("name")?;
            let info_sql = format!("PRAGMA index_info(\"{}\")", name.replace('"', "\"\""));
            let columns = sqlx::query(&info_sql)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|r| r.try_get::<Option<String>, _>("name").map(Option::unwrap_or_default))
                .collect::<Result<Vec<_>, sqlx::Error>>()?;
            if columns == expected {
                index_name = Some(name);
                break;
            }
        }

        Ok(KeyIndexCheck {
            table,
            expected_columns: expected,
            index_name,
        })
    }

    /// Key groups that occur more than once, NULL key parts grouped together.
    pub async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StorageError> {
        let mut groups = Vec::new();
        for table in TargetTable::ALL {
            let key_columns = table.key_columns();
            let cols = key_columns.join(", ");
            let sql = format!(
                "SELECT {cols}, COUNT(*) AS n FROM {} GROUP BY {cols} HAVING COUNT(*) > 1",
                table.as_str()
            );
            for row in sqlx::query(&sql).fetch_all(&self.pool).await? {
                let key = (0..key_columns.len())
                    .map(|idx| row.try_get::<Option<String>, _>(idx))
                    .collect::<Result<Vec<_>, sqlx::Error>>()?;
                groups.push(DuplicateGroup {
                    table,
                    key,
                    count: row.try_get("n")?,
                });
            }
        }
        Ok(groups)
    }
}

fn parse_rfc3339(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Database(sqlx::Error::Decode(Box::new(err))))
}
