use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::models::{ConfidenceLevel, Medication, NormalizationResult};
use crate::sources::{LabelSource, NomenclatureSource};

/// Resolves each medication against the nomenclature resolver (source A)
/// and the label database (source B).
///
/// Lookups run concurrently across medications with a bounded fan-out so
/// external rate limits are respected; a timeout or miss on one source just
/// degrades that source's match to false and never aborts the batch.
pub struct DrugNormalizer {
    nomenclature: Arc<dyn NomenclatureSource>,
    labels: Arc<dyn LabelSource>,
    fan_out: Arc<Semaphore>,
}

impl DrugNormalizer {
    pub fn new(
        nomenclature: Arc<dyn NomenclatureSource>,
        labels: Arc<dyn LabelSource>,
        max_concurrent_lookups: usize,
    ) -> Self {
        Self {
            nomenclature,
            labels,
            fan_out: Arc::new(Semaphore::new(max_concurrent_lookups.max(1))),
        }
    }

    /// Normalize all medications independently and join the results in
    /// input order.
    pub async fn normalize_all(&self, medications: &[Medication]) -> Vec<NormalizationResult> {
        info!(count = medications.len(), "normalizing medications");
        let lookups = medications.iter().map(|med| async move {
            // Holding a permit for the whole per-medication pair of calls
            // keeps total in-flight requests bounded.
            let _permit = self
                .fan_out
                .acquire()
                .await
                .expect("normalizer semaphore closed");
            self.normalize_one(med).await
        });
        join_all(lookups).await
    }

    async fn normalize_one(&self, medication: &Medication) -> NormalizationResult {
        let name = medication.name.trim();

        let (nomenclature, label) = tokio::join!(
            self.resolve_nomenclature(name),
            self.lookup_label(name)
        );

        let (resolved_name, exact_a) = match &nomenclature {
            Some(hit) => (
                Some(hit.canonical.clone().unwrap_or_else(|| name.to_string())),
                hit.exact,
            ),
            None => (None, false),
        };
        let source_a_match = nomenclature.is_some();
        let source_b_match = label;

        // The label database is queried by exact name, so a label hit is an
        // exact match by construction. High therefore always carries at
        // least one exact match.
        let normalization_confidence = match (source_a_match, source_b_match) {
            (true, true) => ConfidenceLevel::High,
            (false, false) => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Medium,
        };

        debug!(
            drug = name,
            source_a_match,
            source_b_match,
            exact = exact_a || source_b_match,
            "medication normalized"
        );

        NormalizationResult {
            name: name.to_string(),
            resolved_name,
            source_a_match,
            source_b_match,
            normalization_confidence,
        }
    }

    /// Exact lookup first, approximate fallback on an empty result. Takes
    /// the source's first-ranked candidate; never invents a rank.
    async fn resolve_nomenclature(&self, name: &str) -> Option<NomenclatureHit> {
        match self.nomenclature.lookup_exact(name).await {
            Ok(candidates) => {
                if let Some(first) = candidates.into_iter().next() {
                    return Some(NomenclatureHit {
                        canonical: first.name,
                        exact: true,
                    });
                }
            }
            Err(e) => log_degraded("nomenclature", name, &e),
        }

        match self.nomenclature.lookup_approximate(name).await {
            Ok(candidates) => candidates.into_iter().next().map(|first| NomenclatureHit {
                canonical: first.name,
                exact: false,
            }),
            Err(e) => {
                log_degraded("nomenclature", name, &e);
                None
            }
        }
    }

    async fn lookup_label(&self, name: &str) -> bool {
        match self.labels.lookup(name).await {
            Ok(summary) => summary.is_some(),
            Err(e) => {
                log_degraded("label", name, &e);
                false
            }
        }
    }
}

struct NomenclatureHit {
    canonical: Option<String>,
    exact: bool,
}

fn log_degraded(source: &str, drug: &str, error: &Error) {
    warn!(source, drug, %error, "lookup degraded to miss");
}
