use std::collections::BTreeMap;

use jst_core::{
    Application, Contact, Job, Metric, ProfileEntry, Response, ResponseKind, SourceRef, SqlValue,
    Staged, TargetTable,
};
use jst_storage::SourceTable;
use serde::Serialize;

use crate::rules::{required_fields, ConsolidationRules, TableMapping};

/// Mapped rows of every source table, in read order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StagedBatch {
    pub jobs: Vec<Staged<Job>>,
    pub applications: Vec<Staged<Application>>,
    pub responses: Vec<Staged<Response>>,
    pub contacts: Vec<Staged<Contact>>,
    pub metrics: Vec<Staged<Metric>>,
    pub profile: Vec<Staged<ProfileEntry>>,
}

impl StagedBatch {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub row_index: usize,
    pub reason: String,
}

/// How one legacy table was mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedTable {
    pub database: String,
    pub table: String,
    pub category: TargetTable,
    /// Target column -> legacy column that supplied it.
    pub column_map: BTreeMap<String, String>,
    /// Legacy columns no mapping consumed.
    pub dropped_columns: Vec<String>,
    pub rows_mapped: usize,
    pub rejections: Vec<RowRejection>,
}

struct RowView<'a> {
    row: &'a [SqlValue],
    columns: &'a BTreeMap<String, usize>,
}

impl RowView<'_> {
    fn value(&self, field: &str) -> Option<&SqlValue> {
        self.columns.get(field).and_then(|idx| self.row.get(*idx))
    }

    fn text(&self, field: &str) -> Option<String> {
        self.value(field).and_then(SqlValue::as_text)
    }

    fn int(&self, field: &str) -> Option<i64> {
        self.value(field).and_then(SqlValue::as_i64)
    }

    fn real(&self, field: &str) -> Option<f64> {
        self.value(field).and_then(SqlValue::as_f64)
    }

    fn flag(&self, field: &str) -> Option<bool> {
        self.value(field).and_then(SqlValue::as_flag)
    }
}

fn resolve_columns(mapping: &TableMapping, table: &SourceTable) -> BTreeMap<String, usize> {
    mapping
        .fields
        .iter()
        .filter_map(|(target, aliases)| {
            aliases
                .iter()
                .find_map(|alias| table.column_index(alias))
                .map(|idx| (target.clone(), idx))
        })
        .collect()
}

/// Maps every row of `table` into `batch` as `category` records.
pub fn map_table(
    rules: &ConsolidationRules,
    database: &str,
    table: &SourceTable,
    category: TargetTable,
    batch: &mut StagedBatch,
) -> MappedTable {
    let mapping = rules.mapping(category).cloned().unwrap_or_default();
    let columns = resolve_columns(&mapping, table);

    let mut report = MappedTable {
        database: database.to_string(),
        table: table.name.clone(),
        category,
        column_map: columns
            .iter()
            .map(|(target, idx)| (target.clone(), table.columns[*idx].name.clone()))
            .collect(),
        dropped_columns: Vec::new(),
        rows_mapped: 0,
        rejections: Vec::new(),
    };

    if category == TargetTable::Profile {
        map_profile_rows(&mapping, database, table, batch, &mut report);
        return report;
    }

    let used: Vec<usize> = columns.values().copied().collect();
    report.dropped_columns = table
        .columns
        .iter()
        .enumerate()
        .filter(|(idx, c)| !used.contains(idx) && !mapping.is_ignored(&c.name))
        .map(|(_, c)| c.name.clone())
        .collect();

    for (row_index, row) in table.rows.iter().enumerate() {
        let view = RowView {
            row,
            columns: &columns,
        };
        let missing: Vec<&str> = required_fields(category)
            .iter()
            .copied()
            .filter(|field| view.text(field).is_none())
            .collect();
        if !missing.is_empty() {
            report.rejections.push(RowRejection {
                row_index,
                reason: format!("missing {}", missing.join(", ")),
            });
            continue;
        }

        let source = SourceRef {
            database: database.to_string(),
            table: table.name.clone(),
            row_index,
        };
        push_record(category, &view, source, batch);
        report.rows_mapped += 1;
    }

    report
}

fn push_record(
    category: TargetTable,
    view: &RowView<'_>,
    source: SourceRef,
    batch: &mut StagedBatch,
) {
    // Required fields were checked by the caller.
    let req = |field: &str| view.text(field).unwrap_or_default();
    match category {
        TargetTable::Jobs => batch.jobs.push(Staged {
            record: Job {
                company: req("company"),
                title: req("title"),
                location: view.text("location"),
                remote: view.flag("remote"),
                salary_min: view.int("salary_min"),
                salary_max: view.int("salary_max"),
                url: view.text("url"),
                source: view.text("source"),
                discovered_date: view.text("discovered_date"),
                relevance_score: view.real("relevance_score"),
                applied: view.flag("applied").unwrap_or(false),
                applied_date: view.text("applied_date"),
            },
            source,
        }),
        TargetTable::Applications => batch.applications.push(Staged {
            record: Application {
                company: req("company"),
                position: req("position"),
                applied_date: view.text("applied_date"),
                method: view.text("method"),
                resume_version: view.text("resume_version"),
                status: view.text("status"),
                response_received: view.flag("response_received").unwrap_or(false),
            },
            source,
        }),
        TargetTable::Responses => {
            let subject = view.text("subject");
            let content = view.text("content");
            let response_type = view.text("response_type").or_else(|| {
                let kind = ResponseKind::classify(subject.as_deref(), content.as_deref());
                Some(kind.as_str().to_string())
            });
            batch.responses.push(Staged {
                record: Response {
                    company: req("company"),
                    subject,
                    received_date: view.text("received_date"),
                    response_type,
                    content,
                },
                source,
            });
        }
        TargetTable::Contacts => batch.contacts.push(Staged {
            record: Contact {
                company: req("company"),
                name: req("name"),
                title: view.text("title"),
                email: view.text("email"),
                linkedin: view.text("linkedin"),
                contacted: view.flag("contacted").unwrap_or(false),
            },
            source,
        }),
        TargetTable::Metrics => batch.metrics.push(Staged {
            record: Metric {
                name: req("name"),
                value: view.real("value"),
                verified: view.flag("verified").unwrap_or(false),
                recorded_at: view.text("recorded_at"),
            },
            source,
        }),
        TargetTable::Profile => {}
    }
}

/// Profile rows are pivoted: every non-ignored column becomes one entry,
/// named by its mapped field or, failing that, by the lowercased column.
fn map_profile_rows(
    mapping: &TableMapping,
    database: &str,
    table: &SourceTable,
    batch: &mut StagedBatch,
    report: &mut MappedTable,
) {
    for (row_index, row) in table.rows.iter().enumerate() {
        let mut produced = 0usize;
        for (column, value) in table.columns.iter().zip(row) {
            if mapping.is_ignored(&column.name) {
                continue;
            }
            let field = mapping
                .target_for(&column.name)
                .map(str::to_string)
                .unwrap_or_else(|| column.name.to_ascii_lowercase());
            batch.profile.push(Staged {
                record: ProfileEntry {
                    field,
                    value: value.as_text(),
                },
                source: SourceRef {
                    database: database.to_string(),
                    table: table.name.clone(),
                    row_index,
                },
            });
            produced += 1;
        }
        if produced == 0 {
            report.rejections.push(RowRejection {
                row_index,
                reason: "no profile columns".into(),
            });
        } else {
            report.rows_mapped += 1;
        }
    }
}
