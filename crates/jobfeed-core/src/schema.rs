//! Structural report over a raw record collection, for observability only.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{scalar_text, RawJobRecord};

const MAX_SAMPLES: usize = 3;
const CUSTOM_DEPARTMENT_FIELD: &str = "Mandantnr/Einrichtungsnr";
const DEPARTMENT_CODES: &str = "Fachbereich-IDs";
const JOB_FAMILY_CODES: &str = "Stellenbezeichnung-IDs";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStat {
    pub name: String,
    /// Observed JSON types, e.g. `["int", "string"]`.
    pub types: BTreeSet<String>,
    pub samples: Vec<String>,
    pub null_count: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaReport {
    pub total_jobs: usize,
    /// Field statistics in first-seen order.
    pub fields: Vec<FieldStat>,
    pub job_id_unique: bool,
    pub job_id_missing_count: usize,
    pub job_id_duplicate_count: usize,
    pub custom_department_population_percent: f64,
    pub department_codes: BTreeMap<String, String>,
    pub jobfamily_codes: BTreeMap<String, String>,
}

impl SchemaReport {
    pub fn field(&self, name: &str) -> Option<&FieldStat> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub fn analyze(records: &[RawJobRecord]) -> SchemaReport {
    let mut fields: Vec<FieldStat> = Vec::new();
    let mut field_index: BTreeMap<String, usize> = BTreeMap::new();
    let mut seen_ids = HashSet::new();
    let mut missing = 0usize;
    let mut duplicates = 0usize;
    let mut custom_department_filled = 0usize;
    let mut department_codes = BTreeMap::new();
    let mut jobfamily_codes = BTreeMap::new();

    for record in records {
        match record.job_id() {
            None => missing += 1,
            Some(id) => {
                if !seen_ids.insert(id) {
                    duplicates += 1;
                }
            }
        }

        if record
            .text(&[CUSTOM_DEPARTMENT_FIELD])
            .is_some_and(|v| !v.is_empty() && v != "0")
        {
            custom_department_filled += 1;
        }

        for (name, value) in record.fields() {
            let idx = *field_index.entry(name.clone()).or_insert_with(|| {
                fields.push(FieldStat {
                    name: name.clone(),
                    ..FieldStat::default()
                });
                fields.len() - 1
            });
            let stat = &mut fields[idx];
            stat.total += 1;
            stat.types.insert(type_name(value).to_string());

            if is_empty(value) {
                stat.null_count += 1;
            } else if stat.samples.len() < MAX_SAMPLES {
                let sample = scalar_text(value).unwrap_or_else(|| value.to_string());
                if !stat.samples.contains(&sample) {
                    stat.samples.push(sample);
                }
            }
        }

        collect_codes(record.get(DEPARTMENT_CODES), &mut department_codes);
        collect_codes(record.get(JOB_FAMILY_CODES), &mut jobfamily_codes);
    }

    let total_jobs = records.len();
    let custom_department_population_percent = if total_jobs > 0 {
        ((custom_department_filled as f64 / total_jobs as f64) * 10_000.0).round() / 100.0
    } else {
        0.0
    };

    SchemaReport {
        total_jobs,
        fields,
        job_id_unique: missing == 0 && duplicates == 0,
        job_id_missing_count: missing,
        job_id_duplicate_count: duplicates,
        custom_department_population_percent,
        department_codes,
        jobfamily_codes,
    }
}

fn collect_codes(table: Option<&Value>, into: &mut BTreeMap<String, String>) {
    match table {
        Some(Value::Object(map)) => {
            for (code, label) in map {
                into.insert(code.clone(), scalar_text(label).unwrap_or_default());
            }
        }
        Some(Value::Array(items)) => {
            for (pos, label) in items.iter().enumerate() {
                into.insert(pos.to_string(), scalar_text(label).unwrap_or_default());
            }
        }
        _ => {}
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::String(_) => "string",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::Bool(_) => "bool",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use serde_json::json;

    #[test]
    fn reports_identity_problems() {
        let records = vec![
            record(json!({"Stellennummer": "A"})),
            record(json!({"Stellennummer": "A"})),
            record(json!({"Titel": "no id"})),
        ];
        let report = analyze(&records);
        assert_eq!(report.total_jobs, 3);
        assert!(!report.job_id_unique);
        assert_eq!(report.job_id_duplicate_count, 1);
        assert_eq!(report.job_id_missing_count, 1);
    }

    #[test]
    fn collects_field_types_samples_and_nulls() {
        let records = vec![
            record(json!({"PLZ": "46483", "IsMinijob": 0, "Tags": []})),
            record(json!({"PLZ": 46485, "IsMinijob": 1.5, "Tags": ["a"]})),
            record(json!({"PLZ": "", "IsMinijob": null})),
            record(json!({"PLZ": "46483"})),
        ];
        let report = analyze(&records);
        let plz = report.field("PLZ").unwrap();
        assert_eq!(plz.total, 4);
        assert_eq!(plz.null_count, 1);
        assert_eq!(plz.types.iter().map(String::as_str).collect::<Vec<_>>(), vec!["int", "string"]);
        assert_eq!(plz.samples, vec!["46483".to_string(), "46485".to_string()]);

        let minijob = report.field("IsMinijob").unwrap();
        assert!(minijob.types.contains("float") && minijob.types.contains("null"));
        let tags = report.field("Tags").unwrap();
        assert_eq!(tags.null_count, 1);
        assert_eq!(tags.samples, vec![r#"["a"]"#.to_string()]);
        assert_eq!(report.fields[0].name, "PLZ");
    }

    #[test]
    fn enumerates_code_tables_and_population() {
        let records = vec![
            record(json!({"Stellennummer": "1", "Mandantnr/Einrichtungsnr": "M1", "Fachbereich-IDs": {"30": "Kita"}})),
            record(json!({"Stellennummer": "2", "Fachbereich-IDs": {"12": "Pflege"}, "Stellenbezeichnung-IDs": {"7": "Koch"}})),
            record(json!({"Stellennummer": "3", "Mandantnr/Einrichtungsnr": ""})),
        ];
        let report = analyze(&records);
        assert!(report.job_id_unique);
        assert_eq!(report.department_codes.len(), 2);
        assert_eq!(report.department_codes["12"], "Pflege");
        assert_eq!(report.jobfamily_codes["7"], "Koch");
        assert_eq!(report.custom_department_population_percent, 33.33);
    }

    #[test]
    fn empty_input_gives_empty_report() {
        let report = analyze(&[]);
        assert_eq!(report.total_jobs, 0);
        assert!(report.job_id_unique);
        assert_eq!(report.custom_department_population_percent, 0.0);
    }
}
