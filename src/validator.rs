use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{Medication, PatientInfo, PrescriptionRecord};

/// Validate a raw field mapping from the parsing collaborator into a
/// [`PrescriptionRecord`], or fail with a `SchemaViolation` naming the
/// offending field.
///
/// Unknown top-level keys are dropped so newer parsers can emit fields this
/// core does not know about. Missing optional fields become empty/absent and
/// are never fabricated. Null entries inside the medications array are
/// placeholders and get dropped; a medication object without a usable name is
/// a violation.
pub fn validate_record(raw: &Value) -> Result<PrescriptionRecord> {
    let map = raw
        .as_object()
        .ok_or_else(|| Error::schema("$", "expected a JSON object"))?;

    let patient = match map.get("patient_info") {
        None | Some(Value::Null) => PatientInfo::default(),
        Some(v) => parse_patient(v)?,
    };

    let diagnosis = opt_string(map.get("diagnosis"), "diagnosis")?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let clinical_notes = opt_string(map.get("clinical_notes"), "clinical_notes")?;

    let medications = parse_medications(map.get("medications"))?;
    let advice = string_list(map.get("advice"), "advice")?;
    let follow_up = string_list(map.get("follow_up"), "follow_up")?;

    // The parsing stage is the only place that can know whether the
    // diagnosis text was present verbatim in the transcript, so the flag
    // arrives as input rather than being re-derived here.
    let diagnosis_inferred = match map.get("diagnosis_inferred") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(Error::schema("diagnosis_inferred", "expected a boolean")),
    };

    let low_information = medications.is_empty() && diagnosis.is_empty();
    if low_information {
        warn!("record accepted with no medications and no diagnosis text");
    }

    debug!(
        medications = medications.len(),
        low_information, "validated prescription record"
    );

    Ok(PrescriptionRecord {
        patient,
        diagnosis,
        clinical_notes,
        medications,
        advice,
        follow_up,
        low_information,
        diagnosis_stated_verbatim: !diagnosis_inferred,
    })
}

fn parse_patient(v: &Value) -> Result<PatientInfo> {
    let map = v
        .as_object()
        .ok_or_else(|| Error::schema("patient_info", "expected a JSON object"))?;

    let age = match map.get("age") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => {
            let age = n
                .as_u64()
                .ok_or_else(|| Error::schema("patient_info.age", "expected a non-negative integer"))?;
            let age = u32::try_from(age)
                .map_err(|_| Error::schema("patient_info.age", "age out of range"))?;
            Some(age)
        }
        // Parsers sometimes emit the age as a string ("62 y").
        Some(Value::String(s)) => s
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .ok(),
        Some(_) => return Err(Error::schema("patient_info.age", "expected a number")),
    };

    Ok(PatientInfo {
        name: opt_string(map.get("name"), "patient_info.name")?,
        age,
        sex: opt_string(map.get("sex"), "patient_info.sex")?,
        mr_no: opt_string(map.get("mr_no"), "patient_info.mr_no")?,
        appointment_date: opt_string(map.get("appointment_date"), "patient_info.appointment_date")?,
    })
}

fn parse_medications(v: Option<&Value>) -> Result<Vec<Medication>> {
    let arr = match v {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(arr)) => arr,
        Some(_) => return Err(Error::schema("medications", "expected an array")),
    };

    let mut medications: Vec<Medication> = Vec::with_capacity(arr.len());
    for (i, entry) in arr.iter().enumerate() {
        // Null placeholders are dropped rather than rejected.
        if entry.is_null() {
            debug!(index = i, "dropping null medication placeholder");
            continue;
        }
        let obj = entry
            .as_object()
            .ok_or_else(|| Error::schema(format!("medications[{i}]"), "expected an object"))?;

        let field = format!("medications[{i}].name");
        let name = match obj.get("name") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(Error::schema(field, "medication name must be non-empty"));
            }
            Some(_) => return Err(Error::schema(field, "expected a string")),
        };

        let med = Medication {
            name,
            dose: opt_string(obj.get("dose"), &format!("medications[{i}].dose"))?,
            frequency: opt_string(obj.get("frequency"), &format!("medications[{i}].frequency"))?,
            duration: opt_string(obj.get("duration"), &format!("medications[{i}].duration"))?,
        };

        // Same normalized name within one record: merge, keeping the most
        // complete field set.
        match medications
            .iter_mut()
            .find(|m| m.normalized_name() == med.normalized_name())
        {
            Some(existing) => existing.merge_from(med),
            None => medications.push(med),
        }
    }
    Ok(medications)
}

fn opt_string(v: Option<&Value>, field: &str) -> Result<Option<String>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Some(_) => Err(Error::schema(field, "expected a string")),
    }
}

fn string_list(v: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(arr)) => {
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                match item {
                    Value::Null => continue,
                    Value::String(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
                    Value::String(_) => continue,
                    _ => return Err(Error::schema(format!("{field}[{i}]"), "expected a string")),
                }
            }
            Ok(out)
        }
        Some(_) => Err(Error::schema(field, "expected an array")),
    }
}
