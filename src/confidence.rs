use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::models::{
    ADVISORY_DISCLAIMER, ConfidenceLevel, ConfidenceReport, NormalizationResult,
    PrescriptionRecord,
};

/// Clinical abbreviations commonly found on handwritten prescriptions.
/// A diagnosis made of nothing but these never scores above Medium.
const KNOWN_ABBREVIATIONS: &[&str] = &[
    "mbc", "cad", "dm", "htn", "ckd", "copd", "chf", "dvt", "pe", "uti", "acs", "mi", "cva",
    "tia", "gerd", "ibs", "ra", "oa", "sle", "ms", "tb", "hiv", "aids", "bph", "afib", "pvd",
    "pad", "ards", "ild", "nsclc", "sclc", "aml", "all", "cml", "cll", "dlbcl", "nhl", "hl",
];

/// A diagnosis shorter than this is not a full clinical phrase.
const MIN_PHRASE_CHARS: usize = 6;

static WORD_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid token regex"));

/// Pure function from validated record + normalization results to a
/// confidence report.
///
/// Overall confidence is the conservative minimum across the diagnosis and
/// every medication: one weak link caps the whole report. Grounding coverage
/// is 100 for a record with zero medications, since there is nothing left
/// ungrounded.
pub fn score(
    record: &PrescriptionRecord,
    normalizations: &[NormalizationResult],
) -> ConfidenceReport {
    let (diagnosis_confidence, diagnosis_reason) = score_diagnosis(record);

    let api_grounding_coverage = grounding_coverage(normalizations);

    let overall_confidence = normalizations
        .iter()
        .map(|n| n.normalization_confidence)
        .fold(diagnosis_confidence, ConfidenceLevel::min);

    info!(
        overall = ?overall_confidence,
        coverage = api_grounding_coverage,
        "confidence scored"
    );

    ConfidenceReport {
        diagnosis_confidence,
        diagnosis_reason,
        overall_confidence,
        api_grounding_coverage,
        medications: normalizations.to_vec(),
        disclaimer: ADVISORY_DISCLAIMER.to_string(),
    }
}

fn score_diagnosis(record: &PrescriptionRecord) -> (ConfidenceLevel, String) {
    let text = record.diagnosis.trim();

    if text.is_empty() {
        return (
            ConfidenceLevel::Low,
            "No diagnosis found in prescription".to_string(),
        );
    }

    // Only the parsing stage can know whether the text appeared verbatim
    // in the transcript; an inferred diagnosis is capped at Low no matter
    // how complete it reads.
    if !record.diagnosis_stated_verbatim {
        return (
            ConfidenceLevel::Low,
            "Diagnosis inferred from medication pattern, not stated in source".to_string(),
        );
    }

    if is_abbreviation(text) {
        return (
            ConfidenceLevel::Medium,
            format!("Abbreviation detected: \"{text}\""),
        );
    }

    if text.chars().count() >= MIN_PHRASE_CHARS {
        (
            ConfidenceLevel::High,
            "Full explicit diagnosis text".to_string(),
        )
    } else {
        (
            ConfidenceLevel::Medium,
            format!("Short diagnosis text: \"{text}\""),
        )
    }
}

/// Purely an abbreviation/acronym: at most two tokens, each all-caps or in
/// the known clinical abbreviation set.
fn is_abbreviation(text: &str) -> bool {
    let tokens: Vec<&str> = WORD_TOKENS.find_iter(text).map(|m| m.as_str()).collect();
    !tokens.is_empty()
        && tokens.len() <= 2
        && tokens.iter().all(|t| {
            t.chars().all(|c| c.is_ascii_uppercase())
                || KNOWN_ABBREVIATIONS.contains(&t.to_lowercase().as_str())
        })
}

fn grounding_coverage(normalizations: &[NormalizationResult]) -> f64 {
    if normalizations.is_empty() {
        // Vacuous truth: with zero medications there are no ungrounded
        // claims possible.
        return 100.0;
    }
    let grounded = normalizations.iter().filter(|n| n.grounded()).count();
    let percent = (grounded as f64 / normalizations.len() as f64) * 100.0;
    (percent * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Medication, PatientInfo};

    fn record(diagnosis: &str, verbatim: bool, med_names: &[&str]) -> PrescriptionRecord {
        let medications = med_names
            .iter()
            .map(|name| Medication {
                name: name.to_string(),
                dose: None,
                frequency: None,
                duration: None,
            })
            .collect::<Vec<_>>();
        PrescriptionRecord {
            patient: PatientInfo::default(),
            diagnosis: diagnosis.to_string(),
            clinical_notes: None,
            low_information: medications.is_empty() && diagnosis.is_empty(),
            medications,
            advice: Vec::new(),
            follow_up: Vec::new(),
            diagnosis_stated_verbatim: verbatim,
        }
    }

    fn norm(name: &str, a: bool, b: bool) -> NormalizationResult {
        let confidence = match (a, b) {
            (true, true) => ConfidenceLevel::High,
            (false, false) => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Medium,
        };
        NormalizationResult {
            name: name.to_string(),
            resolved_name: a.then(|| name.to_string()),
            source_a_match: a,
            source_b_match: b,
            normalization_confidence: confidence,
        }
    }

    #[test]
    fn full_diagnosis_text_scores_high() {
        let report = score(&record("Metastatic Breast Cancer", true, &[]), &[]);
        assert_eq!(report.diagnosis_confidence, ConfidenceLevel::High);
    }

    #[test]
    fn abbreviation_scores_medium() {
        let report = score(&record("MBC", true, &[]), &[]);
        assert_eq!(report.diagnosis_confidence, ConfidenceLevel::Medium);
        assert!(report.diagnosis_reason.contains("Abbreviation"));
    }

    #[test]
    fn inferred_diagnosis_scores_low_regardless_of_length() {
        let report = score(&record("Metastatic Breast Cancer", false, &[]), &[]);
        assert_eq!(report.diagnosis_confidence, ConfidenceLevel::Low);
    }

    #[test]
    fn missing_diagnosis_scores_low() {
        let report = score(&record("", true, &[]), &[]);
        assert_eq!(report.diagnosis_confidence, ConfidenceLevel::Low);
    }

    #[test]
    fn zero_medications_means_full_coverage() {
        let report = score(&record("Essential hypertension", true, &[]), &[]);
        assert_eq!(report.api_grounding_coverage, 100.0);
        // Overall can only degrade through the diagnosis.
        assert_eq!(report.overall_confidence, ConfidenceLevel::High);
    }

    #[test]
    fn one_ungrounded_medication_lowers_coverage_below_100() {
        let norms = vec![norm("Denosumab", true, true), norm("Denosumib", false, false)];
        let report = score(&record("MBC", true, &["Denosumab", "Denosumib"]), &norms);
        assert_eq!(report.api_grounding_coverage, 50.0);
        assert!(report.api_grounding_coverage < 100.0);
    }

    #[test]
    fn coverage_rounds_to_one_decimal() {
        let norms = vec![
            norm("a", true, true),
            norm("b", true, false),
            norm("c", false, false),
        ];
        let report = score(&record("Diabetes mellitus", true, &["a", "b", "c"]), &norms);
        assert_eq!(report.api_grounding_coverage, 66.7);
    }

    #[test]
    fn overall_is_the_weakest_link() {
        let norms = vec![norm("Denosumab", true, true), norm("typo", false, false)];
        let report = score(&record("Metastatic Breast Cancer", true, &[]), &norms);
        assert_eq!(report.diagnosis_confidence, ConfidenceLevel::High);
        assert_eq!(report.overall_confidence, ConfidenceLevel::Low);
    }

    #[test]
    fn overall_never_exceeds_any_constituent() {
        let cases = [
            ("MBC", true, vec![norm("a", true, true)]),
            ("Full clinical phrase", true, vec![norm("a", true, false)]),
            ("", true, vec![]),
        ];
        for (diagnosis, verbatim, norms) in cases {
            let report = score(&record(diagnosis, verbatim, &[]), &norms);
            assert!(report.overall_confidence <= report.diagnosis_confidence);
            for n in &report.medications {
                assert!(report.overall_confidence <= n.normalization_confidence);
            }
        }
    }

    #[test]
    fn scenario_a_exact_match_on_both_sources() {
        let norms = vec![norm("Denosumab", true, true)];
        let report = score(&record("MBC", true, &["Denosumab"]), &norms);
        assert_eq!(
            report.medications[0].normalization_confidence,
            ConfidenceLevel::High
        );
        assert_eq!(report.api_grounding_coverage, 100.0);
    }
}
