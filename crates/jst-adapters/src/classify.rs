use jst_core::TargetTable;
use serde::Serialize;

use crate::rules::ConsolidationRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchReason {
    Override { key: String },
    TableName { keyword: String },
    Column { column: String, keyword: String },
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: Option<TargetTable>,
    pub reason: MatchReason,
}

/// Buckets a legacy table. Overrides win, then table-name keywords, then
/// column keywords; inside each pass the first category in rule order wins.
/// Keyword matching is a case-insensitive substring test.
pub fn classify_table(
    rules: &ConsolidationRules,
    database: &str,
    table: &str,
    columns: &[&str],
) -> Classification {
    let override_key = format!("{database}.{table}");
    if let Some((key, category)) = rules
        .overrides
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&override_key))
    {
        return Classification {
            category: Some(*category),
            reason: MatchReason::Override { key: key.clone() },
        };
    }

    let table_lower = table.to_ascii_lowercase();
    for rule in &rules.categories {
        if let Some(keyword) = rule
            .table_keywords
            .iter()
            .find(|k| table_lower.contains(&k.to_ascii_lowercase()))
        {
            return Classification {
                category: Some(rule.category),
                reason: MatchReason::TableName {
                    keyword: keyword.clone(),
                },
            };
        }
    }

    let columns_lower: Vec<String> = columns.iter().map(|c| c.to_ascii_lowercase()).collect();
    for rule in &rules.categories {
        for keyword in &rule.column_keywords {
            let needle = keyword.to_ascii_lowercase();
            if let Some(idx) = columns_lower.iter().position(|c| c.contains(&needle)) {
                return Classification {
                    category: Some(rule.category),
                    reason: MatchReason::Column {
                        column: columns[idx].to_string(),
                        keyword: keyword.clone(),
                    },
                };
            }
        }
    }

    Classification {
        category: None,
        reason: MatchReason::Unmatched,
    }
}
