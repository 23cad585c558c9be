use std::collections::BTreeMap;
use std::path::Path;

use jst_core::TargetTable;
use serde::{Deserialize, Serialize};

use crate::AdapterError;

const BUILTIN_RULES: &str = include_str!("../../../rules/consolidation.yaml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: TargetTable,
    #[serde(default)]
    pub table_keywords: Vec<String>,
    #[serde(default)]
    pub column_keywords: Vec<String>,
}

/// Target column -> legacy column aliases, tried in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
    /// Legacy columns consumed without being reported as dropped.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl TableMapping {
    /// Target field a legacy column feeds, if any alias names it.
    pub fn target_for(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, aliases)| aliases.iter().any(|a| a.eq_ignore_ascii_case(column)))
            .map(|(target, _)| target.as_str())
    }

    pub fn is_ignored(&self, column: &str) -> bool {
        self.ignore.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRules {
    pub version: u32,
    pub categories: Vec<CategoryRule>,
    /// `"<database>.<table>"` -> category, checked before any keyword.
    #[serde(default)]
    pub overrides: BTreeMap<String, TargetTable>,
    pub mappings: BTreeMap<TargetTable, TableMapping>,
}

/// Fields a row must carry to be kept.
pub fn required_fields(table: TargetTable) -> &'static [&'static str] {
    match table {
        TargetTable::Jobs => &["company", "title"],
        TargetTable::Applications => &["company", "position"],
        TargetTable::Responses => &["company"],
        TargetTable::Contacts => &["company", "name"],
        TargetTable::Metrics => &["name"],
        TargetTable::Profile => &[],
    }
}

impl ConsolidationRules {
    /// The rules shipped in `rules/consolidation.yaml`.
    pub fn builtin() -> Result<Self, AdapterError> {
        Self::from_yaml_str(BUILTIN_RULES)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AdapterError> {
        let rules: Self = serde_yaml::from_str(text)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self, AdapterError> {
        let text = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn mapping(&self, table: TargetTable) -> Option<&TableMapping> {
        self.mappings.get(&table)
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.categories.is_empty() {
            return Err(AdapterError::InvalidRules("no categories defined".into()));
        }
        for table in TargetTable::ALL {
            if table == TargetTable::Profile {
                continue;
            }
            let mapping = self.mappings.get(&table).ok_or_else(|| {
                AdapterError::InvalidRules(format!("no mapping for table `{table}`"))
            })?;
            for field in required_fields(table) {
                let has_alias = mapping
                    .fields
                    .get(*field)
                    .map(|aliases| !aliases.is_empty())
                    .unwrap_or(false);
                if !has_alias {
                    return Err(AdapterError::InvalidRules(format!(
                        "mapping for `{table}` has no aliases for required field `{field}`"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_parse_and_validate() {
        let rules = ConsolidationRules::builtin().expect("builtin rules");
        assert_eq!(rules.version, 1);
        assert_eq!(rules.categories.len(), 6);
        assert_eq!(rules.categories[0].category, TargetTable::Responses);
        assert_eq!(rules.categories[5].category, TargetTable::Jobs);
        let jobs = rules.mapping(TargetTable::Jobs).expect("jobs mapping");
        assert_eq!(jobs.target_for("MIN_SALARY"), Some("salary_min"));
        assert!(jobs.is_ignored("id"));
    }

    #[test]
    fn missing_required_alias_is_rejected() {
        let yaml = r#"
version: 1
categories:
  - category: jobs
    table_keywords: [job]
mappings:
  jobs:
    fields:
      company: [company]
"#;
        let err = ConsolidationRules::from_yaml_str(yaml).expect_err("title is required");
        let msg = err.to_string();
        assert!(msg.contains("no mapping for table") || msg.contains("title"));
    }

    #[test]
    fn rules_load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, BUILTIN_RULES).expect("write");
        let rules = ConsolidationRules::from_yaml_path(&path).expect("load");
        assert_eq!(rules, ConsolidationRules::builtin().expect("builtin"));

        let missing = ConsolidationRules::from_yaml_path(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(AdapterError::Io { .. })));
    }
}
