use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Advisory text attached to every interaction and confidence payload.
/// The system emits signals for human clinical judgment, never directives.
pub const ADVISORY_DISCLAIMER: &str =
    "Interaction and confidence data are advisory only and must not be treated \
     as definitive medical advice.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub mr_no: Option<String>,
    pub appointment_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dose: Option<String>,
    pub frequency: Option<String>,
    pub duration: Option<String>,
}

impl Medication {
    /// Identity key: trimmed, lowercased name. Two medications with the
    /// same key inside one record are duplicates and get merged.
    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }

    /// Fill any absent field from `other`, keeping existing values.
    pub fn merge_from(&mut self, other: Medication) {
        if self.dose.is_none() {
            self.dose = other.dose;
        }
        if self.frequency.is_none() {
            self.frequency = other.frequency;
        }
        if self.duration.is_none() {
            self.duration = other.duration;
        }
    }
}

/// Validated prescription record: the single schema boundary of the system.
/// Built once by the validator, never re-validated downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionRecord {
    pub patient: PatientInfo,
    /// May be empty; emptiness feeds the low-information flag.
    pub diagnosis: String,
    pub clinical_notes: Option<String>,
    pub medications: Vec<Medication>,
    pub advice: Vec<String>,
    pub follow_up: Vec<String>,
    /// Zero medications and no diagnosis text. Read by the confidence scorer.
    pub low_information: bool,
    /// Whether the diagnosis text appeared verbatim in the source, as reported
    /// by the parsing collaborator. False means it was inferred.
    pub diagnosis_stated_verbatim: bool,
}

/// Three-level confidence scale, ordered Low < Medium < High so that the
/// weakest-link minimum is just `Ord::min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

/// Per-medication outcome of cross-source normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationResult {
    pub name: String,
    /// Canonical name from the first-ranked nomenclature candidate, if any.
    pub resolved_name: Option<String>,
    /// Nomenclature resolver matched (exact or approximate).
    pub source_a_match: bool,
    /// Label database matched.
    pub source_b_match: bool,
    pub normalization_confidence: ConfidenceLevel,
}

impl NormalizationResult {
    pub fn grounded(&self) -> bool {
        self.source_a_match || self.source_b_match
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub diagnosis_confidence: ConfidenceLevel,
    pub diagnosis_reason: String,
    pub overall_confidence: ConfidenceLevel,
    /// Percentage of medications with at least one external match,
    /// 0–100 rounded to one decimal. 100 when there are no medications.
    pub api_grounding_coverage: f64,
    pub medications: Vec<NormalizationResult>,
    pub disclaimer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

/// How a pair's risk was determined. Callers can tell deterministic
/// rule-table output from model-derived output, and neither failure mode
/// is ever collapsed into a default risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RiskAssessment {
    /// Matched a static class-pair rule. Same classes, same risk, always.
    RuleMatched { risk: RiskLevel },
    /// No rule matched; a model assessed the pair within the risk vocabulary.
    ModelAssessed { risk: RiskLevel },
    /// Class lookup failed for at least one drug of the pair.
    /// Absence of evidence, not evidence of absence.
    InsufficientData,
    /// The model returned out-of-vocabulary output even after a re-ask.
    UnableToAssess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionFinding {
    /// Unordered pair, stored in sorted order so equality is canonical.
    pub pair: (String, String),
    pub assessment: RiskAssessment,
    pub description: String,
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionReport {
    pub findings: Vec<InteractionFinding>,
    /// Always n·(n−1)/2 for n medications.
    pub pairs_checked: usize,
    pub disclaimer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsupportedClaim {
    pub claim: String,
    pub severity: Severity,
}

/// Result of grounding verification over one generated answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationCheck {
    /// Invariant: equals `claims.len()`.
    pub unsupported_count: usize,
    pub claims: Vec<UnsupportedClaim>,
    /// Claims the checker could not classify (out-of-vocabulary model
    /// output). Reported, never counted as unsupported.
    pub unassessed: Vec<String>,
}

impl HallucinationCheck {
    pub fn grounded() -> Self {
        Self {
            unsupported_count: 0,
            claims: Vec::new(),
            unassessed: Vec::new(),
        }
    }

    pub fn is_grounded(&self) -> bool {
        self.unsupported_count == 0
    }
}

/// One answered question appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaExchange {
    pub question: String,
    pub answer: String,
    pub check: HallucinationCheck,
    pub asked_at: DateTime<Utc>,
}

/// Everything the pipeline knows about one prescription conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub record: PrescriptionRecord,
    pub confidence: ConfidenceReport,
    pub interactions: InteractionReport,
    pub exchanges: Vec<QaExchange>,
}
