use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::confidence;
use crate::error::{Error, Result};
use crate::grounding::GroundingChecker;
use crate::interactions::InteractionDetector;
use crate::llm::LanguageModel;
use crate::models::{HallucinationCheck, QaExchange, SessionContext};
use crate::normalizer::DrugNormalizer;
use crate::sources::{DrugClassSource, LabelSource, LookupPolicy, NomenclatureSource};
use crate::storage::SessionStore;
use crate::validator::validate_record;

/// Tunables for external calls and fan-out width.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-call deadline for every external lookup.
    pub lookup_timeout: Duration,
    /// Backoff before the single permitted retry.
    pub retry_backoff: Duration,
    /// Bounded fan-out for concurrent lookups, respecting source rate limits.
    pub max_concurrent_lookups: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
            max_concurrent_lookups: 4,
        }
    }
}

impl PipelineConfig {
    /// Environment overrides: `RX_GROUND_LOOKUP_TIMEOUT_MS`,
    /// `RX_GROUND_RETRY_BACKOFF_MS`, `RX_GROUND_MAX_CONCURRENT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("RX_GROUND_LOOKUP_TIMEOUT_MS") {
            config.lookup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RX_GROUND_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RX_GROUND_MAX_CONCURRENT") {
            config.max_concurrent_lookups = n.max(1) as usize;
        }
        config
    }

    pub fn lookup_policy(&self) -> LookupPolicy {
        LookupPolicy {
            timeout: self.lookup_timeout,
            retry_backoff: self.retry_backoff,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Orchestrates the post-OCR reasoning stages over one prescription:
/// validation, normalization, confidence scoring, interaction detection,
/// session persistence, and grounding verification of later answers.
pub struct PrescriptionPipeline {
    normalizer: DrugNormalizer,
    detector: InteractionDetector,
    checker: GroundingChecker,
    store: Arc<dyn SessionStore>,
}

impl PrescriptionPipeline {
    pub fn new(
        nomenclature: Arc<dyn NomenclatureSource>,
        labels: Arc<dyn LabelSource>,
        classes: Arc<dyn DrugClassSource>,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn SessionStore>,
        config: PipelineConfig,
    ) -> Self {
        let fan_out = config.max_concurrent_lookups;
        // Model completions run under the same per-call deadline as the
        // external source lookups.
        let deadline = config.lookup_timeout;
        Self {
            normalizer: DrugNormalizer::new(nomenclature, labels, fan_out),
            detector: InteractionDetector::new(classes, model.clone(), fan_out, deadline),
            checker: GroundingChecker::new(model, fan_out, deadline),
            store,
        }
    }

    /// Run the full ingest flow over a raw field mapping from the parsing
    /// collaborator. Returns the new session id with the stored context.
    ///
    /// Only a schema violation aborts; every downstream lookup failure
    /// degrades into the confidence and interaction reports instead.
    #[instrument(skip_all)]
    pub async fn ingest(&self, raw: &Value) -> Result<(String, SessionContext)> {
        let record = validate_record(raw)?;

        let normalizations = self.normalizer.normalize_all(&record.medications).await;
        let confidence = confidence::score(&record, &normalizations);

        // Interactions run over resolved names where normalization found
        // one, otherwise the name as written.
        let drug_names: Vec<String> = normalizations
            .iter()
            .map(|n| n.resolved_name.clone().unwrap_or_else(|| n.name.clone()))
            .collect();
        let interactions = self.detector.detect(&drug_names).await;

        let context = SessionContext {
            record,
            confidence,
            interactions,
            exchanges: Vec::new(),
        };

        let session_id = Uuid::new_v4().to_string();
        self.store.put(session_id.clone(), context.clone()).await?;
        info!(%session_id, "prescription ingested");
        Ok((session_id, context))
    }

    /// Grounding verification for one answered question: fact-check the
    /// already-produced answer against the stored context, then append the
    /// exchange to the session history.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn check_answer(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<HallucinationCheck> {
        let context = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;

        let check = self
            .checker
            .check(answer, &context.record, &context.confidence.medications)
            .await;

        self.store
            .append_exchange(
                session_id,
                QaExchange {
                    question: question.to_string(),
                    answer: answer.to_string(),
                    check: check.clone(),
                    asked_at: Utc::now(),
                },
            )
            .await?;

        info!(
            unsupported = check.unsupported_count,
            unassessed = check.unassessed.len(),
            "answer checked against grounding context"
        );
        Ok(check)
    }

    /// Stored context for a session, or `UnknownSession`.
    pub async fn session(&self, session_id: &str) -> Result<SessionContext> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_bounded() {
        let config = PipelineConfig::default();
        assert!(config.max_concurrent_lookups >= 1);
        assert!(config.lookup_timeout > Duration::ZERO);
        let policy = config.lookup_policy();
        assert_eq!(policy.timeout, config.lookup_timeout);
    }
}
