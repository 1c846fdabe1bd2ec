//! String normalization and synthetic facility identifiers.
//!
//! Facility ids are deterministic but not injective: two organizations whose
//! normalized name and address coincide, or whose digests share a 16-character
//! prefix, get the same id. Collisions are reported by the collision detector
//! in the sync layer instead of being resolved here.

use sha2::{Digest, Sha256};

use crate::RawJobRecord;

/// Length of a facility id in hex characters.
pub const FACILITY_ID_LEN: usize = 16;

pub const ORGANIZATION_FIELDS: &[&str] = &["Einrichtung"];
pub const STREET_FIELDS: &[&str] = &["Strasse", "Straße"];
pub const POSTAL_CODE_FIELDS: &[&str] = &["PLZ"];
pub const CITY_FIELDS: &[&str] = &["Ort"];

/// Lower-cases, transliterates German diacritics to ASCII digraphs and drops
/// everything outside `[a-z0-9]`.
pub fn normalize_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars().flat_map(char::to_lowercase) {
        match c {
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ü' => out.push_str("ue"),
            'ß' => out.push_str("ss"),
            c if c.is_ascii_lowercase() || c.is_ascii_digit() => out.push(c),
            _ => {}
        }
    }
    out
}

/// Facility id of a record, from organization name, street, postal code and city.
pub fn derive_facility_id(record: &RawJobRecord) -> String {
    facility_id_from_parts(
        &record.text_or_empty(ORGANIZATION_FIELDS),
        &record.text_or_empty(STREET_FIELDS),
        &record.text_or_empty(POSTAL_CODE_FIELDS),
        &record.text_or_empty(CITY_FIELDS),
    )
}

/// The postal code enters the key verbatim; the other parts are normalized.
pub fn facility_id_from_parts(organization: &str, street: &str, postal_code: &str, city: &str) -> String {
    let key = format!(
        "{}|{}|{}|{}",
        normalize_string(organization),
        normalize_string(street),
        postal_code,
        normalize_string(city)
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(FACILITY_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use serde_json::json;

    fn is_facility_id(id: &str) -> bool {
        id.len() == FACILITY_ID_LEN && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }

    #[test]
    fn normalize_string_cases() {
        let cases = [
            ("", ""),
            ("ABC", "abc"),
            ("München", "muenchen"),
            ("Straße", "strasse"),
            ("ÄÖÜ", "aeoeue"),
            ("Kita 123 Wesel", "kita123wesel"),
            ("A-W-O (Test)", "awotest"),
            ("Café", "caf"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_string(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn facility_id_is_deterministic() {
        let job = record(json!({
            "Einrichtung": "Kita Sonnenschein",
            "Strasse": "Musterstraße 1",
            "PLZ": "46483",
            "Ort": "Wesel"
        }));
        let first = derive_facility_id(&job);
        assert_eq!(first, derive_facility_id(&job));
        assert!(is_facility_id(&first));
    }

    #[test]
    fn facility_id_ignores_case_and_punctuation() {
        let a = facility_id_from_parts("Kita Sonnenschein", "Musterstraße 1", "46483", "Wesel");
        let b = facility_id_from_parts("KITA sonnenschein!", "Musterstrasse 1", "46483", "WESEL");
        assert_eq!(a, b);
    }

    #[test]
    fn different_organizations_get_different_ids() {
        // Probabilistic: distinct keys collide only on a 64-bit prefix match.
        let a = record(json!({"Einrichtung": "Kita A", "Strasse": "", "PLZ": "46483", "Ort": "Wesel"}));
        let b = record(json!({"Einrichtung": "Kita B", "Strasse": "", "PLZ": "46483", "Ort": "Wesel"}));
        assert_ne!(derive_facility_id(&a), derive_facility_id(&b));
    }

    #[test]
    fn postal_code_is_not_normalized() {
        assert_ne!(
            facility_id_from_parts("Kita", "", "46483", "Wesel"),
            facility_id_from_parts("Kita", "", "46 483", "Wesel")
        );
    }

    #[test]
    fn empty_record_still_yields_an_id() {
        assert!(is_facility_id(&derive_facility_id(&RawJobRecord::default())));
    }
}
