use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::llm::{LanguageModel, strip_code_fence};
use crate::models::{
    ADVISORY_DISCLAIMER, InteractionFinding, InteractionReport, RiskAssessment, RiskLevel,
};
use crate::sources::DrugClassSource;

/// Known high-risk pharmacological class combinations. Rule-matched pairs
/// are deterministic: same class pair, same risk, independent of any model.
struct ClassPairRule {
    class_a: &'static str,
    class_b: &'static str,
    risk: RiskLevel,
    description: &'static str,
    recommendation: &'static str,
}

const CLASS_PAIR_RULES: &[ClassPairRule] = &[
    ClassPairRule {
        class_a: "rank ligand",
        class_b: "bisphosphonate",
        risk: RiskLevel::High,
        description: "Concurrent antiresorptive bone agents raise the risk of severe \
                      hypocalcemia and osteonecrosis of the jaw",
        recommendation: "Avoid combining; monitor serum calcium closely if overlap is \
                         unavoidable",
    },
    ClassPairRule {
        class_a: "nonsteroidal anti-inflammatory",
        class_b: "anticoagulant",
        risk: RiskLevel::High,
        description: "NSAIDs potentiate anticoagulant effect and impair platelet \
                      function, raising bleeding risk",
        recommendation: "Prefer a non-NSAID analgesic; if unavoidable, monitor for \
                         bleeding",
    },
    ClassPairRule {
        class_a: "monoamine oxidase inhibitor",
        class_b: "serotonin reuptake inhibitor",
        risk: RiskLevel::High,
        description: "MAOI with serotonergic agents can precipitate serotonin syndrome",
        recommendation: "Contraindicated; observe the recommended washout period",
    },
    ClassPairRule {
        class_a: "angiotensin-converting enzyme inhibitor",
        class_b: "potassium-sparing diuretic",
        risk: RiskLevel::Moderate,
        description: "Additive potassium retention can lead to hyperkalemia",
        recommendation: "Monitor serum potassium and renal function",
    },
    ClassPairRule {
        class_a: "macrolide",
        class_b: "hmg-coa reductase inhibitor",
        risk: RiskLevel::Moderate,
        description: "Macrolide CYP3A4 inhibition raises statin exposure and myopathy \
                      risk",
        recommendation: "Consider suspending the statin during the macrolide course",
    },
];

const RISK_SYSTEM_PROMPT: &str =
    "You are a clinical pharmacology assistant. You assess potential drug-drug \
     interactions from pharmacological class data. Only flag interactions with real \
     clinical significance; never invent one. Your output is advisory only, not \
     medical advice. Return valid JSON only.";

/// Pairwise drug-drug interaction detection.
///
/// Classes are looked up once per distinct drug with bounded fan-out, then
/// every unordered pair is classified: static rule table first, model
/// assessment as fallback. Lookup failure for a drug marks its pairs as
/// insufficient data rather than pretending no interaction exists.
pub struct InteractionDetector {
    classes: Arc<dyn DrugClassSource>,
    model: Arc<dyn LanguageModel>,
    fan_out: Arc<Semaphore>,
    model_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ModelAssessment {
    risk_level: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    recommendation: Option<String>,
}

impl InteractionDetector {
    pub fn new(
        classes: Arc<dyn DrugClassSource>,
        model: Arc<dyn LanguageModel>,
        max_concurrent_lookups: usize,
        model_timeout: Duration,
    ) -> Self {
        Self {
            classes,
            model,
            fan_out: Arc::new(Semaphore::new(max_concurrent_lookups.max(1))),
            model_timeout,
        }
    }

    /// Model calls carry the same per-call deadline as source lookups. A
    /// stalled model must not hold the whole batch open; the elapsed pair
    /// degrades to unable-to-assess like any other model failure.
    async fn complete_bounded(&self, prompt: &str) -> Result<String> {
        tokio::time::timeout(self.model_timeout, self.model.complete(RISK_SYSTEM_PROMPT, prompt))
            .await
            .map_err(|_elapsed| Error::ExternalLookupTimeout {
                source_name: "risk-model",
            })?
    }

    pub async fn detect(&self, drug_names: &[String]) -> InteractionReport {
        let pairs = unordered_pairs(drug_names);
        let pairs_checked = pairs.len();
        info!(
            drugs = drug_names.len(),
            pairs = pairs_checked,
            "checking drug-drug interactions"
        );

        if pairs.is_empty() {
            return InteractionReport {
                findings: Vec::new(),
                pairs_checked: 0,
                disclaimer: ADVISORY_DISCLAIMER.to_string(),
            };
        }

        let class_map = self.fetch_classes(drug_names).await;
        let class_map = &class_map;

        let assessments = pairs.iter().map(|(a, b)| async move {
            let _permit = self
                .fan_out
                .acquire()
                .await
                .expect("interaction semaphore closed");
            self.assess_pair(a, b, class_map).await
        });

        let findings = join_all(assessments).await.into_iter().flatten().collect();

        InteractionReport {
            findings,
            pairs_checked,
            disclaimer: ADVISORY_DISCLAIMER.to_string(),
        }
    }

    /// One class lookup per distinct drug; `None` marks a failed lookup so
    /// dependent pairs degrade to insufficient data.
    async fn fetch_classes(&self, drug_names: &[String]) -> HashMap<String, Option<Vec<String>>> {
        let lookups = drug_names.iter().map(|name| async move {
            let _permit = self
                .fan_out
                .acquire()
                .await
                .expect("interaction semaphore closed");
            let classes = match self.classes.classes_of(name).await {
                Ok(classes) => Some(classes),
                Err(e) => {
                    warn!(drug = %name, error = %e, "class lookup failed");
                    None
                }
            };
            (name.clone(), classes)
        });
        join_all(lookups).await.into_iter().collect()
    }

    async fn assess_pair(
        &self,
        a: &str,
        b: &str,
        class_map: &HashMap<String, Option<Vec<String>>>,
    ) -> Option<InteractionFinding> {
        let classes_a = class_map.get(a).cloned().flatten();
        let classes_b = class_map.get(b).cloned().flatten();

        let (classes_a, classes_b) = match (classes_a, classes_b) {
            (Some(x), Some(y)) => (x, y),
            // Absence of evidence is not evidence of absence: report the
            // pair instead of silently treating it as no interaction.
            _ => {
                return Some(finding(
                    a,
                    b,
                    RiskAssessment::InsufficientData,
                    "Drug class data unavailable for this pair; interaction risk could \
                     not be evaluated"
                        .to_string(),
                    None,
                ));
            }
        };

        if let Some(rule) = match_rule(&classes_a, &classes_b) {
            debug!(pair = ?(a, b), risk = ?rule.risk, "rule-table match");
            return Some(finding(
                a,
                b,
                RiskAssessment::RuleMatched { risk: rule.risk },
                rule.description.to_string(),
                Some(rule.recommendation.to_string()),
            ));
        }

        match self.assess_with_model(a, b, &classes_a, &classes_b).await {
            Ok(Some((risk, description, recommendation))) => Some(finding(
                a,
                b,
                RiskAssessment::ModelAssessed { risk },
                description,
                recommendation,
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(pair = ?(a, b), error = %e, "model assessment unusable");
                Some(finding(
                    a,
                    b,
                    RiskAssessment::UnableToAssess,
                    "Risk assessment returned an unrecognized category and was \
                     discarded rather than defaulted"
                        .to_string(),
                    None,
                ))
            }
        }
    }

    /// Model fallback for pairs no rule covers. The risk level must come
    /// back inside the three-level vocabulary (or "None" for no clinically
    /// significant interaction); anything else gets one re-ask, then the
    /// pair is reported as unable to assess.
    async fn assess_with_model(
        &self,
        a: &str,
        b: &str,
        classes_a: &[String],
        classes_b: &[String],
    ) -> Result<Option<(RiskLevel, String, Option<String>)>> {
        let prompt = format!(
            r#"Assess the drug-drug interaction between "{a}" and "{b}".

Pharmacological classes of {a}: {classes_a:?}
Pharmacological classes of {b}: {classes_b:?}

Return JSON only:
{{"risk_level": "High" | "Moderate" | "Low" | "None", "description": "...", "recommendation": "..."}}

Use "None" when no clinically significant interaction is known."#
        );

        let raw = self.complete_bounded(&prompt).await?;
        match parse_assessment(&raw) {
            Ok(parsed) => Ok(parsed),
            Err(first_err) => {
                debug!(pair = ?(a, b), error = %first_err, "re-asking model for a valid risk level");
                let strict = format!(
                    "{prompt}\n\nYour previous reply was not a valid classification. \
                     Respond with the JSON object only; risk_level must be exactly one of \
                     High, Moderate, Low, None."
                );
                let raw = self.complete_bounded(&strict).await?;
                parse_assessment(&raw)
            }
        }
    }
}

fn finding(
    a: &str,
    b: &str,
    assessment: RiskAssessment,
    description: String,
    recommendation: Option<String>,
) -> InteractionFinding {
    // Sorted pair keeps the unordered identity canonical.
    let (first, second) = if a.to_lowercase() <= b.to_lowercase() {
        (a, b)
    } else {
        (b, a)
    };
    InteractionFinding {
        pair: (first.to_string(), second.to_string()),
        assessment,
        description,
        recommendation,
    }
}

/// All C(n,2) unordered pairs, no duplicates, no self-pairs.
fn unordered_pairs(names: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(names.len().saturating_sub(1) * names.len() / 2);
    for (i, a) in names.iter().enumerate() {
        for b in names.iter().skip(i + 1) {
            if a.trim().eq_ignore_ascii_case(b.trim()) {
                continue;
            }
            pairs.push((a.clone(), b.clone()));
        }
    }
    pairs
}

fn match_rule(classes_a: &[String], classes_b: &[String]) -> Option<&'static ClassPairRule> {
    CLASS_PAIR_RULES.iter().find(|rule| {
        (contains_class(classes_a, rule.class_a) && contains_class(classes_b, rule.class_b))
            || (contains_class(classes_a, rule.class_b) && contains_class(classes_b, rule.class_a))
    })
}

fn contains_class(classes: &[String], needle: &str) -> bool {
    classes.iter().any(|c| c.to_lowercase().contains(needle))
}

fn parse_assessment(raw: &str) -> Result<Option<(RiskLevel, String, Option<String>)>> {
    let cleaned = strip_code_fence(raw);
    let parsed: ModelAssessment =
        serde_json::from_str(cleaned).map_err(|_| Error::ClassificationOutOfVocabulary {
            raw: raw.to_string(),
        })?;

    let risk = match parsed.risk_level.trim() {
        r if r.eq_ignore_ascii_case("high") => RiskLevel::High,
        r if r.eq_ignore_ascii_case("moderate") => RiskLevel::Moderate,
        r if r.eq_ignore_ascii_case("low") => RiskLevel::Low,
        r if r.eq_ignore_ascii_case("none") => return Ok(None),
        _ => {
            return Err(Error::ClassificationOutOfVocabulary {
                raw: raw.to_string(),
            });
        }
    };

    Ok(Some((
        risk,
        parsed
            .description
            .unwrap_or_else(|| "Potential interaction flagged by model assessment".to_string()),
        parsed.recommendation,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeClasses {
        table: HashMap<String, Vec<String>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl DrugClassSource for FakeClasses {
        async fn classes_of(&self, name: &str) -> Result<Vec<String>> {
            if self.failing.iter().any(|f| f == name) {
                return Err(Error::ExternalLookupTimeout { source_name: "fake" });
            }
            Ok(self.table.get(name).cloned().unwrap_or_default())
        }
    }

    /// Model returning scripted responses in order.
    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::Model("script exhausted".to_string()))
        }
    }

    fn bone_agent_classes() -> HashMap<String, Vec<String>> {
        HashMap::from([
            (
                "Denosumab".to_string(),
                vec!["RANK Ligand Inhibitor [EPC]".to_string()],
            ),
            (
                "Zoledronic acid".to_string(),
                vec!["Bisphosphonate [EPC]".to_string()],
            ),
            (
                "Calcium carbonate".to_string(),
                vec!["Calcium Salt [EPC]".to_string()],
            ),
        ])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn detector(classes: FakeClasses, model: ScriptedModel) -> InteractionDetector {
        InteractionDetector::new(
            Arc::new(classes),
            Arc::new(model),
            4,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn pair_enumeration_yields_n_choose_2() {
        for n in 0..6usize {
            let drugs: Vec<String> = (0..n).map(|i| format!("drug{i}")).collect();
            let pairs = unordered_pairs(&drugs);
            assert_eq!(pairs.len(), n * n.saturating_sub(1) / 2);
            for (a, b) in &pairs {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn pair_enumeration_skips_self_pairs() {
        let pairs = unordered_pairs(&names(&["Aspirin", "aspirin "]));
        assert!(pairs.is_empty());
    }

    #[test]
    fn rule_matching_is_symmetric_and_deterministic() {
        let a = vec!["Bisphosphonate [EPC]".to_string()];
        let b = vec!["RANK Ligand Inhibitor [EPC]".to_string()];
        let forward = match_rule(&b, &a).expect("rule should match");
        let reverse = match_rule(&a, &b).expect("rule should match");
        assert_eq!(forward.risk, RiskLevel::High);
        assert_eq!(reverse.risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn scenario_b_bone_agent_combination_is_rule_matched_high() {
        let det = detector(
            FakeClasses {
                table: bone_agent_classes(),
                failing: vec![],
            },
            ScriptedModel::new(&[]),
        );
        let report = det
            .detect(&names(&["Denosumab", "Zoledronic acid"]))
            .await;
        assert_eq!(report.pairs_checked, 1);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(
            report.findings[0].assessment,
            RiskAssessment::RuleMatched {
                risk: RiskLevel::High
            }
        );
        assert!(!report.disclaimer.is_empty());
    }

    #[tokio::test]
    async fn rule_miss_falls_back_to_model_within_vocabulary() {
        let det = detector(
            FakeClasses {
                table: bone_agent_classes(),
                failing: vec![],
            },
            ScriptedModel::new(&[
                r#"{"risk_level": "Low", "description": "Minimal interaction", "recommendation": null}"#,
            ]),
        );
        let report = det
            .detect(&names(&["Denosumab", "Calcium carbonate"]))
            .await;
        assert_eq!(report.findings.len(), 1);
        assert_eq!(
            report.findings[0].assessment,
            RiskAssessment::ModelAssessed {
                risk: RiskLevel::Low
            }
        );
    }

    #[tokio::test]
    async fn model_none_means_no_finding() {
        let det = detector(
            FakeClasses {
                table: bone_agent_classes(),
                failing: vec![],
            },
            ScriptedModel::new(&[r#"{"risk_level": "None"}"#]),
        );
        let report = det
            .detect(&names(&["Denosumab", "Calcium carbonate"]))
            .await;
        assert!(report.findings.is_empty());
        assert_eq!(report.pairs_checked, 1);
    }

    /// Model whose completions never resolve.
    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_model_times_out_into_unable_to_assess() {
        let det = InteractionDetector::new(
            Arc::new(FakeClasses {
                table: bone_agent_classes(),
                failing: vec![],
            }),
            Arc::new(StalledModel),
            4,
            Duration::from_millis(20),
        );
        // Rule-table miss, so the pair goes to the model, which hangs.
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            det.detect(&names(&["Denosumab", "Calcium carbonate"])),
        )
        .await
        .expect("detection must finish within the model deadline");
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].assessment, RiskAssessment::UnableToAssess);
    }

    #[tokio::test]
    async fn out_of_vocabulary_after_reask_is_unable_to_assess() {
        let det = detector(
            FakeClasses {
                table: bone_agent_classes(),
                failing: vec![],
            },
            ScriptedModel::new(&[
                r#"{"risk_level": "Severe"}"#,
                "it depends on the patient",
            ]),
        );
        let report = det
            .detect(&names(&["Denosumab", "Calcium carbonate"]))
            .await;
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].assessment, RiskAssessment::UnableToAssess);
    }

    #[tokio::test]
    async fn scenario_e_lookup_failure_poisons_only_its_pairs() {
        let det = detector(
            FakeClasses {
                table: bone_agent_classes(),
                failing: vec!["Calcium carbonate".to_string()],
            },
            ScriptedModel::new(&[]),
        );
        let report = det
            .detect(&names(&["Denosumab", "Zoledronic acid", "Calcium carbonate"]))
            .await;
        assert_eq!(report.pairs_checked, 3);

        let insufficient: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.assessment == RiskAssessment::InsufficientData)
            .collect();
        assert_eq!(insufficient.len(), 2);
        for f in &insufficient {
            assert!(f.pair.0 == "Calcium carbonate" || f.pair.1 == "Calcium carbonate");
        }

        // The untouched pair still resolves normally via the rule table.
        let resolved = report
            .findings
            .iter()
            .find(|f| f.assessment != RiskAssessment::InsufficientData)
            .expect("bone-agent pair should still resolve");
        assert_eq!(
            resolved.assessment,
            RiskAssessment::RuleMatched {
                risk: RiskLevel::High
            }
        );
    }

    #[tokio::test]
    async fn fewer_than_two_drugs_checks_no_pairs() {
        let det = detector(
            FakeClasses {
                table: HashMap::new(),
                failing: vec![],
            },
            ScriptedModel::new(&[]),
        );
        let report = det.detect(&names(&["Denosumab"])).await;
        assert_eq!(report.pairs_checked, 0);
        assert!(report.findings.is_empty());
    }
}
