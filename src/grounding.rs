use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::llm::{LanguageModel, parse_constrained};
use crate::models::{
    HallucinationCheck, NormalizationResult, PrescriptionRecord, Severity, UnsupportedClaim,
};

/// Patterns marking patient-safety-relevant claims: a wrong dosage,
/// frequency or contraindication does the most harm when taken at face
/// value.
static SAFETY_CRITICAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b\d+(\.\d+)?\s*(mg|mcg|µg|g|ml|l|iu|units?)\b").expect("dose regex"),
        Regex::new(r"(?i)\b(once|twice|three\s+times|\d+\s*times?)\s+(a\s+|per\s+)?(day|daily|week|weekly|month|monthly|hour)\b")
            .expect("frequency regex"),
        Regex::new(r"(?i)\b(every|each)\s+\d+\s*(hours?|days?|weeks?|months?)\b")
            .expect("interval regex"),
        Regex::new(r"(?i)\b(contraindicat\w*|do\s+not\s+(take|use|combine)|must\s+not|avoid\s+taking)\b")
            .expect("contraindication regex"),
    ]
});

/// Diagnosis-adjacent vocabulary: wrong but not directly dose-dangerous.
static DIAGNOSIS_ADJACENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(diagnos\w*|condition|disease|cancer|syndrome|disorder|infection|prognosis|stage|metasta\w*)\b",
    )
    .expect("diagnosis regex")
});

/// A sentence worth fact-checking at all: asserts something concrete.
static ASSERTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(is|are|was|has|have|take[sn]?|contains?|causes?|treats?|should|must|prescribed|indicated|recommended|interacts?)\b",
    )
    .expect("assertive regex")
});

const FACT_CHECK_SYSTEM: &str =
    "You are a medical fact-checking system. You verify whether a single claim from \
     an AI-generated answer is supported by the provided prescription context. A claim \
     is supported only if it appears in, or is directly entailed by, the context. Never \
     use outside medical knowledge to fill gaps. This pass only annotates; it never \
     rewrites the answer.";

/// Classifies each factual claim of an already-produced answer as supported
/// or unsupported by the grounding context.
///
/// This is an independent annotation pass: the answer is never regenerated
/// or edited. A fully grounded answer still produces a concrete check with
/// count 0 so callers can render a positive confirmation.
pub struct GroundingChecker {
    model: Arc<dyn LanguageModel>,
    fan_out: Arc<Semaphore>,
    model_timeout: Duration,
}

impl GroundingChecker {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        max_concurrent_checks: usize,
        model_timeout: Duration,
    ) -> Self {
        Self {
            model,
            fan_out: Arc::new(Semaphore::new(max_concurrent_checks.max(1))),
            model_timeout,
        }
    }

    /// Verdict calls carry a per-call deadline. A stalled model leaves the
    /// claim unassessed instead of holding the whole check open.
    async fn complete_bounded(&self, prompt: &str) -> Result<String> {
        tokio::time::timeout(self.model_timeout, self.model.complete(FACT_CHECK_SYSTEM, prompt))
            .await
            .map_err(|_elapsed| Error::ExternalLookupTimeout {
                source_name: "fact-check-model",
            })?
    }

    pub async fn check(
        &self,
        answer: &str,
        record: &PrescriptionRecord,
        normalizations: &[NormalizationResult],
    ) -> HallucinationCheck {
        if answer.trim().is_empty() {
            return HallucinationCheck::grounded();
        }

        let claims = extract_claims(answer, record);
        if claims.is_empty() {
            debug!("answer contains no checkable factual claims");
            return HallucinationCheck::grounded();
        }

        let context = grounding_context(record, normalizations);
        let context = &context;
        info!(claims = claims.len(), "fact-checking answer claims");

        let verdicts = join_all(claims.iter().map(|claim| async move {
            let _permit = self
                .fan_out
                .acquire()
                .await
                .expect("grounding semaphore closed");
            self.classify_claim(claim, context).await
        }))
        .await;

        let mut unsupported = Vec::new();
        let mut unassessed = Vec::new();
        for (claim, verdict) in claims.into_iter().zip(verdicts) {
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    let severity = claim_severity(&claim, record);
                    unsupported.push(UnsupportedClaim { claim, severity });
                }
                Err(e) => {
                    // Out-of-vocabulary output is fatal for this claim only
                    // and never guessed into a verdict.
                    warn!(%claim, error = %e, "claim could not be assessed");
                    unassessed.push(claim);
                }
            }
        }

        HallucinationCheck {
            unsupported_count: unsupported.len(),
            claims: unsupported,
            unassessed,
        }
    }

    /// Returns true when supported. One re-ask on out-of-vocabulary output.
    async fn classify_claim(&self, claim: &str, context: &str) -> Result<bool> {
        const VOCABULARY: [(&str, bool); 2] = [("supported", true), ("unsupported", false)];

        let prompt = format!(
            "Context (prescription record and external drug data):\n{context}\n\n\
             Claim to verify:\n{claim}\n\n\
             Respond with exactly one word: supported or unsupported."
        );

        let raw = self.complete_bounded(&prompt).await?;
        match parse_constrained(&raw, &VOCABULARY) {
            Ok(verdict) => Ok(verdict),
            Err(_) => {
                let strict = format!(
                    "{prompt}\n\nYour previous reply was not a valid classification. \
                     Answer with the single word supported or unsupported, nothing else."
                );
                let raw = self.complete_bounded(&strict).await?;
                parse_constrained(&raw, &VOCABULARY)
            }
        }
    }
}

/// Flatten the stored record and normalization facts into the text the
/// claim verdicts are grounded against.
fn grounding_context(
    record: &PrescriptionRecord,
    normalizations: &[NormalizationResult],
) -> String {
    let mut facts = Vec::new();

    if !record.diagnosis.is_empty() {
        facts.push(format!("Diagnosis: {}", record.diagnosis));
    }
    if let Some(notes) = &record.clinical_notes {
        facts.push(format!("Clinical notes: {notes}"));
    }
    for med in &record.medications {
        let mut line = format!("Medication: {}", med.name);
        if let Some(dose) = &med.dose {
            line.push_str(&format!(", dose {dose}"));
        }
        if let Some(frequency) = &med.frequency {
            line.push_str(&format!(", frequency {frequency}"));
        }
        if let Some(duration) = &med.duration {
            line.push_str(&format!(", duration {duration}"));
        }
        facts.push(line);
    }
    for item in record.advice.iter().chain(record.follow_up.iter()) {
        facts.push(format!("Instruction: {item}"));
    }
    for n in normalizations {
        if let Some(resolved) = &n.resolved_name {
            facts.push(format!(
                "External sources resolve \"{}\" as \"{}\"",
                n.name, resolved
            ));
        } else if !n.grounded() {
            facts.push(format!(
                "\"{}\" was not found in any external drug source",
                n.name
            ));
        }
    }

    facts.join("\n")
}

/// Decompose an answer into sentences and keep the ones that assert
/// something checkable: a number, a medication from the record, or an
/// assertive verb.
fn extract_claims(answer: &str, record: &PrescriptionRecord) -> Vec<String> {
    let med_names: Vec<String> = record
        .medications
        .iter()
        .map(|m| m.normalized_name())
        .collect();

    split_sentences(answer)
        .into_iter()
        .filter(|sentence| {
            let lower = sentence.to_lowercase();
            sentence.chars().any(|c| c.is_ascii_digit())
                || med_names.iter().any(|name| lower.contains(name))
                || ASSERTIVE.is_match(sentence)
        })
        .collect()
}

/// Abbreviations whose trailing period is not a sentence boundary.
const NON_TERMINAL_ABBREVIATIONS: &[&str] = &[
    "dr.", "mr.", "mrs.", "ms.", "prof.", "e.g.", "i.e.", "vs.", "etc.", "approx.", "no.",
    "tab.", "cap.", "inj.",
];

fn ends_with_abbreviation(prefix: &str) -> bool {
    let lower = prefix.to_lowercase();
    NON_TERMINAL_ABBREVIATIONS
        .iter()
        .any(|abbr| lower.ends_with(abbr))
}

/// Sentence splitter tolerating clinical abbreviations and decimal doses.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        current.push(c);
        if c == '!' || c == '?' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        if c == '.' {
            // Decimal point inside a number ("0.5 mg") is not a boundary.
            let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let next_digit = chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if (prev_digit && next_digit) || ends_with_abbreviation(&current) {
                continue;
            }
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Deterministic severity assignment for an unsupported claim.
fn claim_severity(claim: &str, record: &PrescriptionRecord) -> Severity {
    if SAFETY_CRITICAL.iter().any(|p| p.is_match(claim)) {
        return Severity::High;
    }

    let lower = claim.to_lowercase();
    let mentions_diagnosis = !record.diagnosis.is_empty()
        && record
            .diagnosis
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .any(|w| lower.contains(&w.to_lowercase()));
    if mentions_diagnosis || DIAGNOSIS_ADJACENT.is_match(claim) {
        return Severity::Medium;
    }

    Severity::Low
}
