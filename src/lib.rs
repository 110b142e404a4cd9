//! Post-OCR reasoning core for handwritten prescriptions.
//!
//! Takes the raw field mapping produced by a parsing collaborator and turns
//! it into a validated [`PrescriptionRecord`], grounds each medication
//! against external nomenclature and label sources, scores confidence per
//! stage, flags possible drug-drug interactions, and verifies whether
//! model-generated answers are actually supported by the stored context.
//! OCR, answer generation, retrieval, and transport are collaborators
//! reached only through the traits in [`sources`], [`llm`], and [`storage`].
//!
//! Every output is advisory. Low confidence and insufficient data are
//! first-class outcomes, never hidden failures.

pub mod confidence;
pub mod error;
pub mod grounding;
pub mod interactions;
pub mod llm;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod sources;
pub mod storage;
pub mod validator;

// Re-export commonly used types
pub use error::{Error, Result};
pub use grounding::GroundingChecker;
pub use interactions::InteractionDetector;
pub use llm::LanguageModel;
pub use models::{
    ADVISORY_DISCLAIMER, ConfidenceLevel, ConfidenceReport, HallucinationCheck,
    InteractionFinding, InteractionReport, Medication, NormalizationResult, PatientInfo,
    PrescriptionRecord, QaExchange, RiskAssessment, RiskLevel, SessionContext, Severity,
    UnsupportedClaim,
};
pub use normalizer::DrugNormalizer;
pub use pipeline::{PipelineConfig, PrescriptionPipeline};
pub use sources::{
    DailyMedClient, DrugClassSource, LabelSource, LabelSummary, LookupPolicy,
    NomenclatureCandidate, NomenclatureSource, RxClassClient, RxNormClient,
};
pub use storage::{InMemorySessionStore, SessionStore};
pub use validator::validate_record;
