use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Per-call policy for external lookups: one deadline, at most one retry
/// with backoff, then the call is reported as a timeout and the caller
/// degrades it to a miss.
#[derive(Debug, Clone)]
pub struct LookupPolicy {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Run an external call under the policy's deadline, retrying once on
/// timeout or transport failure.
pub(crate) async fn call_with_retry<T, F, Fut>(
    source_name: &'static str,
    policy: &LookupPolicy,
    call: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..2 {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(Error::Transport(e))) if attempt == 0 => {
                warn!(source = source_name, error = %e, "transport failure, retrying after backoff");
            }
            Ok(Err(other)) => return Err(other),
            Err(_elapsed) if attempt == 0 => {
                warn!(source = source_name, "lookup timed out, retrying after backoff");
            }
            Err(_elapsed) => return Err(Error::ExternalLookupTimeout { source_name }),
        }
        tokio::time::sleep(policy.retry_backoff).await;
    }
    Err(Error::ExternalLookupTimeout { source_name })
}

/// One ranked candidate from a nomenclature resolver. The rank is the
/// source's own relevance ordering; this core never re-ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct NomenclatureCandidate {
    pub identifier: String,
    /// Canonical name, when the source reports one.
    pub name: Option<String>,
}

/// Summary of one drug-label document.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSummary {
    pub title: Option<String>,
    pub setid: Option<String>,
    pub published_date: Option<String>,
}

/// Resolves free-text drug names to canonical identifiers. Source A of the
/// normalizer.
#[async_trait]
pub trait NomenclatureSource: Send + Sync {
    /// Exact-name lookup. Empty result is a normal outcome.
    async fn lookup_exact(&self, name: &str) -> Result<Vec<NomenclatureCandidate>>;

    /// Fuzzy/alias fallback used only when the exact lookup came back empty.
    /// Sources without fuzzy support keep the default empty result.
    async fn lookup_approximate(&self, _name: &str) -> Result<Vec<NomenclatureCandidate>> {
        Ok(Vec::new())
    }
}

/// Label database lookup. Source B of the normalizer.
#[async_trait]
pub trait LabelSource: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<LabelSummary>>;
}

/// Pharmacological class lookup feeding the interaction detector.
#[async_trait]
pub trait DrugClassSource: Send + Sync {
    async fn classes_of(&self, name: &str) -> Result<Vec<String>>;
}

const RXNORM_BASE: &str = "https://rxnav.nlm.nih.gov/REST";
const DAILYMED_BASE: &str = "https://dailymed.nlm.nih.gov/dailymed/services/v2";

/// RxNorm nomenclature resolver (rxcui by name, approximate-term fallback).
pub struct RxNormClient {
    http: reqwest::Client,
    base_url: String,
    policy: LookupPolicy,
}

impl RxNormClient {
    pub fn new(policy: LookupPolicy) -> Self {
        Self::with_base_url(RXNORM_BASE, policy)
    }

    pub fn with_base_url(base_url: impl Into<String>, policy: LookupPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            policy,
        }
    }

    async fn get_json(&self, url: String) -> Result<Value> {
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ExternalLookupMiss {
                source_name: "rxnorm",
                query: url,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl NomenclatureSource for RxNormClient {
    async fn lookup_exact(&self, name: &str) -> Result<Vec<NomenclatureCandidate>> {
        let url = format!("{}/rxcui.json?name={}", self.base_url, urlencoding::encode(name));
        let data =
            call_with_retry("rxnorm", &self.policy, move || self.get_json(url.clone())).await?;

        let ids = data["idGroup"]["rxnormId"].as_array().cloned().unwrap_or_default();
        let candidates: Vec<NomenclatureCandidate> = ids
            .iter()
            .filter_map(|v| v.as_str())
            .map(|id| NomenclatureCandidate {
                identifier: id.to_string(),
                name: data["idGroup"]["name"].as_str().map(str::to_string),
            })
            .collect();
        debug!(drug = name, matches = candidates.len(), "rxnorm exact lookup");
        Ok(candidates)
    }

    async fn lookup_approximate(&self, name: &str) -> Result<Vec<NomenclatureCandidate>> {
        let url = format!(
            "{}/approximateTerm.json?term={}&maxEntries=5",
            self.base_url,
            urlencoding::encode(name)
        );
        let data =
            call_with_retry("rxnorm", &self.policy, move || self.get_json(url.clone())).await?;

        // Candidates arrive ranked by the source's own score; keep that order.
        let candidates = data["approximateGroup"]["candidate"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c["rxcui"].as_str())
                    .map(|id| NomenclatureCandidate {
                        identifier: id.to_string(),
                        name: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        debug!(drug = name, "rxnorm approximate lookup");
        Ok(candidates)
    }
}

/// DailyMed label database client.
pub struct DailyMedClient {
    http: reqwest::Client,
    base_url: String,
    policy: LookupPolicy,
}

impl DailyMedClient {
    pub fn new(policy: LookupPolicy) -> Self {
        Self::with_base_url(DAILYMED_BASE, policy)
    }

    pub fn with_base_url(base_url: impl Into<String>, policy: LookupPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            policy,
        }
    }
}

#[async_trait]
impl LabelSource for DailyMedClient {
    async fn lookup(&self, name: &str) -> Result<Option<LabelSummary>> {
        let url = format!("{}/spls.json?drug_name={}", self.base_url, urlencoding::encode(name));
        let http = &self.http;
        let url = url.as_str();
        let data = call_with_retry("dailymed", &self.policy, move || async move {
            let response = http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(Error::ExternalLookupMiss {
                    source_name: "dailymed",
                    query: url.to_string(),
                });
            }
            Ok(response.json::<Value>().await?)
        })
        .await?;

        let first = match data["data"].as_array().and_then(|arr| arr.first()) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        Ok(Some(LabelSummary {
            title: first["title"].as_str().map(str::to_string),
            setid: first["setid"].as_str().map(str::to_string),
            published_date: first["published_date"].as_str().map(str::to_string),
        }))
    }
}

/// RxClass pharmacological class lookup.
pub struct RxClassClient {
    http: reqwest::Client,
    base_url: String,
    policy: LookupPolicy,
}

impl RxClassClient {
    pub fn new(policy: LookupPolicy) -> Self {
        Self::with_base_url(RXNORM_BASE, policy)
    }

    pub fn with_base_url(base_url: impl Into<String>, policy: LookupPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            policy,
        }
    }
}

#[async_trait]
impl DrugClassSource for RxClassClient {
    async fn classes_of(&self, name: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/rxclass/class/byDrugName.json?drugName={}",
            self.base_url,
            urlencoding::encode(name)
        );
        let http = &self.http;
        let url = url.as_str();
        let data = call_with_retry("rxclass", &self.policy, move || async move {
            let response = http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(Error::ExternalLookupMiss {
                    source_name: "rxclass",
                    query: url.to_string(),
                });
            }
            Ok(response.json::<Value>().await?)
        })
        .await?;

        // The same class often arrives once per relaSource; keep first
        // occurrences in the source's order.
        let mut seen = std::collections::HashSet::new();
        let classes: Vec<String> = data["rxclassDrugInfoList"]["rxclassDrugInfo"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|info| info["rxclassMinConceptItem"]["className"].as_str())
                    .filter(|name| seen.insert(name.to_lowercase()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        debug!(drug = name, classes = classes.len(), "rxclass lookup");
        Ok(classes)
    }
}
