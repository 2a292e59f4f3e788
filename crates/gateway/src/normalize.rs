use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use medsum_contracts::{LabObservation, MedicationRecord, ProblemRecord, VitalObservation};
use serde_json::Value;

type MedicationKey = (String, Option<String>, Option<String>, Option<String>);

/// Converts raw medication records and collapses near-duplicates.
///
/// Records share a key when their uppercased name, dose, route and sig match.
/// A key that has an ACTIVE or PENDING record drops every other status for that
/// key; remaining records are deduplicated on (key, status) in input order.
pub fn normalize_medications(raw: &[Value]) -> Vec<MedicationRecord> {
    let keyed = raw
        .iter()
        .map(|med| (med, medication_key(med), medication_status(med)))
        .collect::<Vec<_>>();

    let active_keys = keyed
        .iter()
        .filter(|(_, _, status)| is_active_or_pending(status))
        .map(|(_, key, _)| key.clone())
        .collect::<HashSet<_>>();

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (med, key, status) in keyed {
        if !is_active_or_pending(&status) && active_keys.contains(&key) {
            continue;
        }
        if !seen.insert((key, status)) {
            continue;
        }
        out.push(convert_medication(med));
    }
    out
}

pub fn convert_medication(med: &Value) -> MedicationRecord {
    let order = first_entry(field(med, &["orders"]));
    let dosage = first_entry(field(med, &["dosages"]));
    let product = first_entry(field(med, &["products"]));

    MedicationRecord {
        name: string_or_none(med.get("name")),
        dose: string_or_none(dosage.and_then(|d| field(d, &["dose"]))),
        route: string_or_none(dosage.and_then(|d| field(d, &["route_name", "routeName"]))),
        sig: string_or_none(field(med, &["sig"])),
        status: string_or_none(field(med, STATUS_FIELDS)),
        drug_class: string_or_none(
            product.and_then(|p| field(p, &["drug_class_name", "drugClassName"])),
        ),
        ordered_date: to_us_date(order.and_then(|o| field(o, &["ordered"]))),
        last_filled: to_us_date(field(med, &["last_filled", "lastFilled"])),
        fills_allowed: to_int(order.and_then(|o| field(o, &["fills_allowed", "fillsAllowed"]))),
        fills_remaining: to_int(
            order.and_then(|o| field(o, &["fills_remaining", "fillsRemaining"])),
        ),
        provider_name: string_or_none(
            order.and_then(|o| field(o, &["provider_name", "providerName"])),
        ),
    }
}

pub fn convert_problem(problem: &Value) -> ProblemRecord {
    ProblemRecord {
        uid: string_or_none(problem.get("uid")),
        name: string_or_none(field(problem, &["problem_text", "problemText"])),
        icd_code: string_or_none(field(problem, &["icd_code", "icdCode"])),
        status: string_or_none(field(problem, &["status_name", "statusName"])),
        onset: to_iso_date(field(problem, &["onset"])),
    }
}

/// Groups lab results by test name, newest first, keeping `n_most_recent`.
pub fn group_labs(raw: &[Value], n_most_recent: usize) -> BTreeMap<String, Vec<LabObservation>> {
    let mut grouped: BTreeMap<String, Vec<LabObservation>> = BTreeMap::new();
    for lab in raw {
        grouped
            .entry(series_name(lab))
            .or_default()
            .push(LabObservation {
                value: string_or_none(field(lab, &["result"])),
                units: string_or_none(field(lab, &["units"])),
                date: to_iso_date(field(lab, &["observed"])),
            });
    }

    for series in grouped.values_mut() {
        series.sort_by(|a, b| date_key(&b.date).cmp(date_key(&a.date)));
        series.truncate(n_most_recent);
    }
    grouped
}

pub fn group_vitals(
    raw: &[Value],
    n_most_recent: usize,
) -> BTreeMap<String, Vec<VitalObservation>> {
    let mut grouped: BTreeMap<String, Vec<VitalObservation>> = BTreeMap::new();
    for vital in raw {
        grouped
            .entry(series_name(vital))
            .or_default()
            .push(VitalObservation {
                value: string_or_none(field(vital, &["result"])),
                date: to_iso_date(field(vital, &["observed"])),
            });
    }

    for series in grouped.values_mut() {
        series.sort_by(|a, b| date_key(&b.date).cmp(date_key(&a.date)));
        series.truncate(n_most_recent);
    }
    grouped
}

/// Parses the upstream timestamp shapes: RFC 3339 with offset or `Z`,
/// optional fractional seconds, naive date-time, or a plain date.
pub fn parse_upstream_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

pub fn to_us_date(value: Option<&Value>) -> Option<String> {
    date_of(value).map(|d| d.format("%m/%d/%Y").to_string())
}

pub fn to_iso_date(value: Option<&Value>) -> Option<String> {
    date_of(value).map(|d| d.format("%Y-%m-%d").to_string())
}

const STATUS_FIELDS: &[&str] = &["va_status", "vaStatus", "med_status", "medStatus"];

fn medication_key(med: &Value) -> MedicationKey {
    let dosage = first_entry(field(med, &["dosages"]));
    let upper = |v: Option<&Value>| string_or_none(v).map(|s| s.to_uppercase());

    (
        string_or_none(med.get("name"))
            .map(|s| s.to_uppercase())
            .unwrap_or_default(),
        upper(dosage.and_then(|d| field(d, &["dose"]))),
        upper(dosage.and_then(|d| field(d, &["route_name", "routeName"]))),
        upper(field(med, &["sig"])),
    )
}

fn medication_status(med: &Value) -> String {
    string_or_none(field(med, STATUS_FIELDS))
        .map(|s| s.to_uppercase())
        .unwrap_or_default()
}

fn is_active_or_pending(status: &str) -> bool {
    status == "ACTIVE" || status == "PENDING"
}

fn series_name(record: &Value) -> String {
    string_or_none(field(record, &["type_name", "typeName"]))
        .or_else(|| string_or_none(field(record, &["display_name", "displayName"])))
        .unwrap_or_else(|| "Unknown".to_string())
}

fn date_key(date: &Option<String>) -> &str {
    date.as_deref().unwrap_or("")
}

fn date_of(value: Option<&Value>) -> Option<NaiveDate> {
    match value? {
        Value::String(s) => parse_upstream_date(s),
        _ => None,
    }
}

/// First present, non-null value among `keys`.
fn field<'a>(source: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| source.get(*k))
        .find(|v| !v.is_null())
}

fn first_entry(value: Option<&Value>) -> Option<&Value> {
    value?.as_array()?.iter().find(|v| v.is_object())
}

fn string_or_none(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    Some(text).filter(|s| !s.is_empty())
}

fn to_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn med(name: &str, status: &str) -> Value {
        json!({
            "name": name,
            "vaStatus": status,
            "sig": "TAKE ONE TABLET BY MOUTH DAILY",
            "dosages": [{"dose": "10MG", "routeName": "ORAL"}],
        })
    }

    #[test]
    fn active_record_suppresses_other_statuses_for_same_key() {
        let meds = vec![
            med("lisinopril 10mg tab", "DISCONTINUED"),
            med("LISINOPRIL 10MG TAB", "ACTIVE"),
        ];

        let out = normalize_medications(&meds);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status.as_deref(), Some("ACTIVE"));
    }

    #[test]
    fn pending_counts_as_active_and_duplicates_collapse() {
        let meds = vec![
            med("METFORMIN", "PENDING"),
            med("METFORMIN", "PENDING"),
            med("METFORMIN", "EXPIRED"),
            med("ASPIRIN", "EXPIRED"),
            med("ASPIRIN", "DISCONTINUED"),
            med("ASPIRIN", "EXPIRED"),
        ];

        let out = normalize_medications(&meds);
        let summary = out
            .iter()
            .map(|m| (m.name.as_deref(), m.status.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (Some("METFORMIN"), Some("PENDING")),
                (Some("ASPIRIN"), Some("EXPIRED")),
                (Some("ASPIRIN"), Some("DISCONTINUED")),
            ]
        );
    }

    #[test]
    fn different_sig_is_a_different_medication() {
        let mut other = med("LISINOPRIL", "DISCONTINUED");
        other["sig"] = json!("TAKE TWO TABLETS");
        let out = normalize_medications(&[med("LISINOPRIL", "ACTIVE"), other]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn medication_conversion_reads_first_order_and_product() {
        let raw = json!({
            "name": "ATORVASTATIN 40MG TAB",
            "va_status": "ACTIVE",
            "sig": "  ",
            "last_filled": "2024-03-05T10:00:00Z",
            "dosages": [{"dose": "40MG", "route_name": "ORAL"}],
            "products": [{"drug_class_name": "ANTILIPEMIC AGENTS"}],
            "orders": [
                {"ordered": "2024-01-02T08:30:00.123-05:00", "fills_allowed": 3, "fillsRemaining": "2", "providerName": "SMITH,JANE"},
                {"ordered": "2020-01-01", "provider_name": "IGNORED"}
            ]
        });

        let record = convert_medication(&raw);
        assert_eq!(record.dose.as_deref(), Some("40MG"));
        assert_eq!(record.route.as_deref(), Some("ORAL"));
        assert_eq!(record.sig, None);
        assert_eq!(record.drug_class.as_deref(), Some("ANTILIPEMIC AGENTS"));
        assert_eq!(record.ordered_date.as_deref(), Some("01/02/2024"));
        assert_eq!(record.last_filled.as_deref(), Some("03/05/2024"));
        assert_eq!(record.fills_allowed, Some(3));
        assert_eq!(record.fills_remaining, Some(2));
        assert_eq!(record.provider_name.as_deref(), Some("SMITH,JANE"));
    }

    #[test]
    fn problem_conversion_normalizes_onset() {
        let raw = json!({
            "uid": "urn:va:problem:1",
            "problemText": "Essential hypertension",
            "icd_code": "I10",
            "statusName": "ACTIVE",
            "onset": "2019-06-01T00:00:00"
        });

        let record = convert_problem(&raw);
        assert_eq!(record.name.as_deref(), Some("Essential hypertension"));
        assert_eq!(record.icd_code.as_deref(), Some("I10"));
        assert_eq!(record.onset.as_deref(), Some("2019-06-01"));
    }

    #[test]
    fn date_parsing_accepts_upstream_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 2, 29);
        for raw in [
            "2024-02-29T23:15:00Z",
            "2024-02-29T23:15:00+02:00",
            "2024-02-29T23:15:00.250000Z",
            "2024-02-29T23:15:00",
            "2024-02-29T23:15:00.5",
            "2024-02-29",
        ] {
            assert_eq!(parse_upstream_date(raw), expected, "input {}", raw);
        }
        assert_eq!(parse_upstream_date("02/29/2024"), None);
        assert_eq!(parse_upstream_date(""), None);
    }

    #[test]
    fn labs_group_by_type_newest_first_and_truncate() {
        let labs = vec![
            json!({"type_name": "HEMOGLOBIN A1C", "result": "7.1", "units": "%", "observed": "2024-01-10"}),
            json!({"type_name": "HEMOGLOBIN A1C", "result": "6.8", "units": "%", "observed": "2024-06-10"}),
            json!({"type_name": "HEMOGLOBIN A1C", "result": "7.4", "units": "%", "observed": "2023-06-10"}),
            json!({"displayName": "POTASSIUM", "result": 4.1, "observed": "2024-05-01T09:00:00Z"}),
            json!({"result": "12"}),
        ];

        let grouped = group_labs(&labs, 2);
        let a1c = &grouped["HEMOGLOBIN A1C"];
        assert_eq!(a1c.len(), 2);
        assert_eq!(a1c[0].value.as_deref(), Some("6.8"));
        assert_eq!(a1c[1].value.as_deref(), Some("7.1"));
        assert_eq!(grouped["POTASSIUM"][0].value.as_deref(), Some("4.1"));
        assert_eq!(grouped["POTASSIUM"][0].date.as_deref(), Some("2024-05-01"));
        assert_eq!(grouped["Unknown"][0].date, None);
    }

    #[test]
    fn vitals_without_dates_sort_last() {
        let vitals = vec![
            json!({"typeName": "BLOOD PRESSURE", "result": "130/85"}),
            json!({"typeName": "BLOOD PRESSURE", "result": "128/80", "observed": "2024-04-01"}),
        ];

        let grouped = group_vitals(&vitals, 3);
        let bp = &grouped["BLOOD PRESSURE"];
        assert_eq!(bp[0].value.as_deref(), Some("128/80"));
        assert_eq!(bp[1].date, None);
    }
}
