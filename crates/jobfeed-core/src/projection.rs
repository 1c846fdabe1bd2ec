//! Flattening of raw feed records into the columns of the live job view.

use serde::{Deserialize, Serialize};

use crate::normalize::{derive_facility_id, CITY_FIELDS, ORGANIZATION_FIELDS, POSTAL_CODE_FIELDS, STREET_FIELDS};
use crate::{RawJobRecord, RunId, CHANGE_FIELDS};

const WORKSITE_POSTAL_CODE_FIELDS: &[&str] = &["PLZ_Einsatzort", "plz_einsatzort"];
const WORKSITE_FIELDS: &[&str] = &["Einsatzort", "einsatzort"];
const WORKSITE_STREET_FIELDS: &[&str] = &["Straße/Nr des Einsatzortes", "Strasse/Nr des Einsatzortes"];
const WORKSITE_STREET_KEY_HINTS: &[&str] = &["einsatzortes", "nr des"];
const DEPARTMENT_FIELDS: &[&str] = &["Fachbereich"];
const DEPARTMENT_CODES: &str = "Fachbereich-IDs";
const CUSTOM_DEPARTMENT_FIELDS: &[&str] = &["Mandantnr/Einrichtungsnr"];
const JOB_FAMILY_CODES: &str = "Stellenbezeichnung-IDs";

/// Classification copied onto lifecycle events for filtered queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClassification {
    pub facility_id: String,
    pub jobfamily_id: String,
    pub department_api_id: String,
    pub department_custom: String,
}

impl JobClassification {
    pub fn of(record: &RawJobRecord) -> Self {
        Self {
            facility_id: derive_facility_id(record),
            jobfamily_id: record.first_code(JOB_FAMILY_CODES).map(|(id, _)| id).unwrap_or_default(),
            department_api_id: record.first_code(DEPARTMENT_CODES).map(|(id, _)| id).unwrap_or_default(),
            department_custom: record.text_or_empty(CUSTOM_DEPARTMENT_FIELDS),
        }
    }
}

/// One row of the live job view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProjection {
    pub job_id: String,
    pub facility_id: String,
    pub facility_name: String,
    pub facility_address: String,
    pub plz_einsatzort: String,
    pub strasse_einsatzort: String,
    pub einsatzort: String,
    pub department_api: String,
    pub department_api_id: String,
    pub department_custom: String,
    pub jobfamily_id: String,
    pub jobfamily_name: String,
    pub contract_type: String,
    pub employment_type: String,
    pub work_time_model: String,
    pub is_minijob: bool,
    pub created_at: i64,
    pub modified_at: i64,
    pub published_at: i64,
    pub expires_at: i64,
    pub last_seen_run_id: RunId,
    pub raw: RawJobRecord,
}

impl JobProjection {
    /// `None` for records without an identity; they never reach the view.
    pub fn from_record(record: &RawJobRecord, run_id: RunId) -> Option<Self> {
        let job_id = record.job_id()?;
        let classification = JobClassification::of(record);
        let (jobfamily_id, jobfamily_name) = record.first_code(JOB_FAMILY_CODES).unwrap_or_default();

        Some(Self {
            job_id,
            facility_id: classification.facility_id,
            facility_name: record.text_or_empty(ORGANIZATION_FIELDS),
            facility_address: facility_address(record),
            plz_einsatzort: record.text_or_empty(WORKSITE_POSTAL_CODE_FIELDS),
            strasse_einsatzort: worksite_street(record),
            einsatzort: record.text_or_empty(WORKSITE_FIELDS).trim().to_string(),
            department_api: record.text_or_empty(DEPARTMENT_FIELDS),
            department_api_id: classification.department_api_id,
            department_custom: classification.department_custom,
            jobfamily_id,
            jobfamily_name,
            contract_type: record.text_or_empty(&["Vertragsart"]),
            employment_type: record.text_or_empty(&["Anstellungsart"]),
            work_time_model: record.text_or_empty(&["Zeitmodell"]),
            is_minijob: record.integer(&["IsMinijob"]) != 0,
            created_at: record.integer(&["Anlagedatum"]),
            modified_at: record.integer(CHANGE_FIELDS),
            published_at: record.integer(&["Startdatum"]),
            expires_at: record.integer(&["Stopdatum"]),
            last_seen_run_id: run_id,
            raw: record.clone(),
        })
    }
}

/// `"street, postal city"` with dangling separators removed.
fn facility_address(record: &RawJobRecord) -> String {
    let street = record.text_or_empty(STREET_FIELDS);
    let postal_code = record.text_or_empty(POSTAL_CODE_FIELDS);
    let city = record.text_or_empty(CITY_FIELDS);
    if street.is_empty() && postal_code.is_empty() && city.is_empty() {
        return String::new();
    }
    format!("{street}, {postal_code} {city}")
        .trim_matches(|c| c == ' ' || c == ',')
        .to_string()
}

fn worksite_street(record: &RawJobRecord) -> String {
    if let Some(street) = record.non_empty_text(WORKSITE_STREET_FIELDS) {
        return street;
    }
    record
        .fields()
        .iter()
        .find(|(key, _)| {
            let key = key.to_lowercase();
            WORKSITE_STREET_KEY_HINTS.iter().any(|hint| key.contains(hint))
        })
        .and_then(|(_, value)| crate::scalar_text(value))
        .map(|street| street.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use serde_json::json;

    fn sample() -> RawJobRecord {
        record(json!({
            "Stellennummer": "S-100",
            "Einrichtung": "Kita Sonnenschein",
            "Strasse": "Musterstraße 1",
            "PLZ": "46483",
            "Ort": "Wesel",
            "PLZ_Einsatzort": "46485",
            "Einsatzort": " Wesel-Nord ",
            "Strasse/Nr des Einsatzortes": "Am Park 3",
            "Fachbereich": "Kindertagesstätten",
            "Fachbereich-IDs": {"30": "Kindertagesstätten"},
            "Mandantnr/Einrichtungsnr": "M-7",
            "Stellenbezeichnung-IDs": {"112": "Erzieher/in", "113": "Kinderpfleger/in"},
            "Vertragsart": "unbefristet",
            "Anstellungsart": "Teilzeit",
            "Zeitmodell": "Schicht",
            "IsMinijob": "0",
            "Anlagedatum": 1700000000,
            "Aenderungsdatum": "1700000500",
            "Startdatum": 1700001000,
            "Stopdatum": null
        }))
    }

    #[test]
    fn flattens_known_fields() {
        let row = JobProjection::from_record(&sample(), 42).expect("has identity");
        assert_eq!(row.job_id, "S-100");
        assert_eq!(row.facility_name, "Kita Sonnenschein");
        assert_eq!(row.facility_address, "Musterstraße 1, 46483 Wesel");
        assert_eq!(row.plz_einsatzort, "46485");
        assert_eq!(row.einsatzort, "Wesel-Nord");
        assert_eq!(row.strasse_einsatzort, "Am Park 3");
        assert_eq!(row.department_api_id, "30");
        assert_eq!(row.department_custom, "M-7");
        assert_eq!(row.jobfamily_id, "112");
        assert_eq!(row.jobfamily_name, "Erzieher/in");
        assert_eq!(row.employment_type, "Teilzeit");
        assert!(!row.is_minijob);
        assert_eq!(row.modified_at, 1_700_000_500);
        assert_eq!(row.expires_at, 0);
        assert_eq!(row.last_seen_run_id, 42);
        assert_eq!(row.facility_id.len(), crate::FACILITY_ID_LEN);
        assert_eq!(row.raw, sample());
    }

    #[test]
    fn address_drops_dangling_separators() {
        let only_city = record(json!({"Stellennummer": "1", "Ort": "Wesel"}));
        assert_eq!(JobProjection::from_record(&only_city, 1).unwrap().facility_address, "Wesel");
        let nothing = record(json!({"Stellennummer": "1"}));
        assert_eq!(JobProjection::from_record(&nothing, 1).unwrap().facility_address, "");
    }

    #[test]
    fn worksite_street_falls_back_to_similar_keys() {
        let r = record(json!({"Stellennummer": "1", "Straße/Nr. des Einsatzortes": " Ring 5 "}));
        assert_eq!(JobProjection::from_record(&r, 1).unwrap().strasse_einsatzort, "Ring 5");
    }

    #[test]
    fn records_without_identity_are_not_projected() {
        assert!(JobProjection::from_record(&record(json!({"Einrichtung": "x"})), 1).is_none());
    }

    #[test]
    fn classification_uses_first_codes() {
        let c = JobClassification::of(&sample());
        assert_eq!(c.jobfamily_id, "112");
        assert_eq!(c.department_api_id, "30");
        assert_eq!(c.department_custom, "M-7");
    }
}
