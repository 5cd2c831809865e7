//! Declarative post-transform checks: uniqueness, non-null, and relationships.
//!
//! Checks are independent. A failing check never stops the others and never
//! touches the relations it inspects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chanlake_core::Table;
use chanlake_storage::{Warehouse, WarehouseError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const EMBEDDED_CHECKS: &str = include_str!("../../../models/checks.yaml");

#[derive(Debug, Clone, Deserialize)]
struct ChecksFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    relations: Vec<RelationChecks>,
}

#[derive(Debug, Clone, Deserialize)]
struct RelationChecks {
    name: String,
    #[serde(default)]
    columns: Vec<ColumnChecks>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnChecks {
    name: String,
    #[serde(default)]
    tests: Vec<TestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TestEntry {
    Named(String),
    Relationships { relationships: RelationshipTarget },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelationshipTarget {
    pub to: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    Unique,
    NotNull,
    Relationships(RelationshipTarget),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckDef {
    pub name: String,
    pub relation: String,
    pub column: String,
    pub kind: CheckKind,
}

impl CheckDef {
    pub fn new(relation: &str, column: &str, kind: CheckKind) -> Self {
        let name = match &kind {
            CheckKind::Unique => format!("unique_{relation}_{column}"),
            CheckKind::NotNull => format!("not_null_{relation}_{column}"),
            CheckKind::Relationships(target) => {
                format!("relationships_{relation}_{column}__{}", target.to)
            }
        };
        Self {
            name,
            relation: relation.to_string(),
            column: column.to_string(),
            kind,
        }
    }

    /// Relations this check reads.
    fn relations(&self) -> Vec<&str> {
        match &self.kind {
            CheckKind::Relationships(target) => vec![self.relation.as_str(), target.to.as_str()],
            _ => vec![self.relation.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub failing_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub results: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect()
    }
}

pub fn embedded_checks() -> Result<Vec<CheckDef>> {
    parse_checks(EMBEDDED_CHECKS).context("parsing embedded models/checks.yaml")
}

pub fn load_checks(path: &Path) -> Result<Vec<CheckDef>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_checks(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_checks(yaml: &str) -> Result<Vec<CheckDef>> {
    let file: ChecksFile = serde_yaml::from_str(yaml)?;
    let mut checks = Vec::new();
    for relation in &file.relations {
        for column in &relation.columns {
            for test in &column.tests {
                let kind = match test {
                    TestEntry::Named(name) => match name.as_str() {
                        "unique" => CheckKind::Unique,
                        "not_null" => CheckKind::NotNull,
                        other => bail!(
                            "unknown test `{other}` on {}.{}",
                            relation.name,
                            column.name
                        ),
                    },
                    TestEntry::Relationships { relationships } => {
                        CheckKind::Relationships(relationships.clone())
                    }
                };
                checks.push(CheckDef::new(&relation.name, &column.name, kind));
            }
        }
    }
    Ok(checks)
}

/// Evaluate one check against already-read relations.
pub fn evaluate(check: &CheckDef, tables: &HashMap<String, Table>) -> CheckResult {
    match failing_rows(check, tables) {
        Ok(failing_rows) => CheckResult {
            name: check.name.clone(),
            passed: failing_rows == 0,
            failing_rows,
            error: None,
        },
        Err(err) => CheckResult {
            name: check.name.clone(),
            passed: false,
            failing_rows: 0,
            error: Some(err),
        },
    }
}

fn column_keys(
    tables: &HashMap<String, Table>,
    relation: &str,
    column: &str,
) -> Result<Vec<Option<String>>, String> {
    let table = tables
        .get(relation)
        .ok_or_else(|| format!("relation `{relation}` is not available"))?;
    let values = table
        .column_values(column)
        .ok_or_else(|| format!("relation `{relation}` has no column `{column}`"))?;
    Ok(values.map(|v| v.key()).collect())
}

fn failing_rows(check: &CheckDef, tables: &HashMap<String, Table>) -> Result<usize, String> {
    let keys = column_keys(tables, &check.relation, &check.column)?;
    let failing = match &check.kind {
        CheckKind::NotNull => keys.iter().filter(|k| k.is_none()).count(),
        CheckKind::Unique => {
            let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
            for key in keys.iter().flatten() {
                *seen.entry(key.as_str()).or_default() += 1;
            }
            seen.values().filter(|n| **n > 1).sum()
        }
        CheckKind::Relationships(target) => {
            let parents: HashSet<String> = column_keys(tables, &target.to, &target.field)?
                .into_iter()
                .flatten()
                .collect();
            keys.iter()
                .flatten()
                .filter(|k| !parents.contains(k.as_str()))
                .count()
        }
    };
    Ok(failing)
}

/// Run every check against the warehouse. Relations that were never built make
/// their checks fail; other storage errors abort.
pub async fn validate_warehouse(warehouse: &Warehouse, checks: &[CheckDef]) -> Result<ValidationReport> {
    let mut tables: HashMap<String, Table> = HashMap::new();
    for name in checks.iter().flat_map(CheckDef::relations) {
        if tables.contains_key(name) {
            continue;
        }
        match warehouse.read_relation(name).await {
            Ok(table) => {
                tables.insert(name.to_string(), table);
            }
            Err(WarehouseError::MissingRelation(_)) | Err(WarehouseError::UnknownRelation(_)) => {
                warn!(relation = name, "relation unavailable for validation");
            }
            Err(err) => return Err(err).with_context(|| format!("reading relation {name}")),
        }
    }

    let results: Vec<CheckResult> = checks.iter().map(|c| evaluate(c, &tables)).collect();
    for result in results.iter().filter(|r| !r.passed) {
        warn!(check = %result.name, failing_rows = result.failing_rows, error = ?result.error, "check failed");
    }
    let report = ValidationReport { results };
    info!(
        checks = report.results.len(),
        failed = report.failed_names().len(),
        "validation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlake_core::{relations, DimChannel, FactMessage};

    fn fact(id: Option<i64>, channel: Option<i64>) -> FactMessage {
        FactMessage {
            channel: "chemedapp".into(),
            message_id: id,
            channel_id: channel,
            date_day: None,
            posted_at: None,
            message_text: None,
            message_length: None,
            view_count: None,
            sender_id: None,
            has_photo: false,
        }
    }

    fn tables(items: Vec<Table>) -> HashMap<String, Table> {
        items.into_iter().map(|t| (t.name.clone(), t)).collect()
    }

    #[test]
    fn embedded_checks_parse_with_conventional_names() {
        let checks = embedded_checks().unwrap();
        let names: Vec<_> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"unique_dim_channels_channel_id"));
        assert!(names.contains(&"not_null_fct_messages_message_id"));
        assert!(names.contains(&"relationships_fct_image_detections_message_id__fct_messages"));
        assert!(names.contains(&"relationships_fct_messages_date_day__dim_dates"));
    }

    #[test]
    fn unknown_test_names_are_rejected() {
        let yaml = "version: 1\nrelations:\n  - name: dim_dates\n    columns:\n      - name: date_day\n        tests: [accepted_values]\n";
        assert!(parse_checks(yaml).is_err());
    }

    #[test]
    fn unique_and_not_null_count_offending_rows() {
        let t = tables(vec![Table::from_rows(&[
            fact(Some(1), Some(10)),
            fact(Some(1), Some(10)),
            fact(None, Some(10)),
        ])]);
        let unique = evaluate(
            &CheckDef::new(relations::FCT_MESSAGES, "message_id", CheckKind::Unique),
            &t,
        );
        let not_null = evaluate(
            &CheckDef::new(relations::FCT_MESSAGES, "message_id", CheckKind::NotNull),
            &t,
        );
        assert_eq!((unique.passed, unique.failing_rows), (false, 2));
        assert_eq!((not_null.passed, not_null.failing_rows), (false, 1));
    }

    #[test]
    fn relationships_ignore_nulls_and_flag_orphans() {
        let t = tables(vec![
            Table::from_rows(&[DimChannel { channel_id: 10, channel_name: "Channel 10".into() }]),
            Table::from_rows(&[fact(Some(1), Some(10)), fact(Some(2), None), fact(Some(3), Some(99))]),
        ]);
        let check = CheckDef::new(
            relations::FCT_MESSAGES,
            "channel_id",
            CheckKind::Relationships(RelationshipTarget {
                to: relations::DIM_CHANNELS.into(),
                field: "channel_id".into(),
            }),
        );
        let result = evaluate(&check, &t);
        assert!(!result.passed);
        assert_eq!(result.failing_rows, 1);
    }

    #[test]
    fn missing_relation_fails_only_its_own_check() {
        let t = tables(vec![Table::from_rows(&[fact(Some(1), Some(10))])]);
        let orphan_check = CheckDef::new(
            relations::FCT_DETECTIONS,
            "detection_id",
            CheckKind::Unique,
        );
        let ok_check = CheckDef::new(relations::FCT_MESSAGES, "message_id", CheckKind::Unique);

        let report = ValidationReport {
            results: vec![evaluate(&orphan_check, &t), evaluate(&ok_check, &t)],
        };
        assert_eq!(report.failed_names(), vec!["unique_fct_image_detections_detection_id"]);
        assert!(report.results[0].error.is_some());
    }
}
