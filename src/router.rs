//! Health-aware routing for embedding and generation requests.
//!
//! The router is data, not reflection: a decision matrix over request
//! hints, text characteristics, and dependency health. Cache consultation
//! happens in the façade before routing; the router picks the compute
//! path for a miss.
//!
//! Embedding matrix, in order:
//! 1. short + simple + no quality requirement → local fast path
//! 2. registered domain expert for the detected domain → that model
//! 3. complex or quality-required → premium remote model
//! 4. latency-sensitive → local fast path, cache after
//! 5. otherwise → local ensemble, cache after
//!
//! Near the complexity boundary (±0.05) the cheaper path wins. An open
//! provider breaker degrades remote choices to local when a local backend
//! exists, and errors out when none does.
//!
//! Generation routing is thin: validate the model against the catalog and
//! clamp the token budget to the family cap.

use std::collections::BTreeMap;

use tracing::debug;

use crate::breaker::BreakerState;
use crate::config::{ModelCatalog, ModelSpec};
use crate::types::EmbedRequest;
use crate::{MimirError, Result};

/// Complexity below this (with short text) takes the local fast path.
const SIMPLE_COMPLEXITY: f32 = 0.3;
/// Complexity above this takes the premium remote path.
const COMPLEX_COMPLEXITY: f32 = 0.7;
/// Short-text threshold for the local fast path, in characters.
const SHORT_TEXT_LEN: usize = 200;
/// Scores closer than this to a boundary prefer the cheaper path.
const TIE_BREAK_MARGIN: f32 = 0.05;

/// Keyword table for domain detection. An explicit `domain` tag wins.
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "legal",
        &["contract", "clause", "liability", "statute", "jurisdiction", "indemnity"],
    ),
    (
        "medical",
        &["diagnosis", "patient", "clinical", "dosage", "symptom", "treatment"],
    ),
    (
        "finance",
        &["portfolio", "ledger", "liquidity", "derivative", "amortization", "invoice"],
    ),
];

/// Minimum keyword hits before a domain is attributed.
const DOMAIN_MIN_HITS: usize = 2;

/// Measured characteristics of a request text.
#[derive(Debug, Clone)]
pub struct TextAnalysis {
    pub length: usize,
    /// Heuristic complexity in `[0, 1]`.
    pub complexity: f32,
    pub domain: Option<String>,
    /// Coarse language tag: "en" or "other".
    pub language: &'static str,
}

impl TextAnalysis {
    /// Analyze a text with its routing tags.
    pub fn of(text: &str, tags: &BTreeMap<String, String>) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();
        let complexity = complexity_score(text, &words);

        let domain = tags
            .get("domain")
            .cloned()
            .or_else(|| detect_domain(&words));

        let ascii = text.chars().filter(|c| c.is_ascii()).count();
        let language = if text.is_empty() || ascii * 10 >= text.chars().count() * 9 {
            "en"
        } else {
            "other"
        };

        Self {
            length: text.chars().count(),
            complexity,
            domain,
            language,
        }
    }
}

/// Word-shape complexity: long words and high vocabulary diversity push
/// the score up. Bounded to `[0, 1]`.
fn complexity_score(text: &str, words: &[&str]) -> f32 {
    if words.is_empty() {
        return 0.0;
    }
    let avg_word_len =
        words.iter().map(|w| w.chars().count()).sum::<usize>() as f32 / words.len() as f32;
    let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
    let diversity = unique.len() as f32 / words.len() as f32;
    let length_pressure = (text.len() as f32 / 2000.0).min(1.0);

    let score = (avg_word_len / 12.0).min(1.0) * 0.4 + diversity * 0.3 + length_pressure * 0.3;
    score.clamp(0.0, 1.0)
}

fn detect_domain(words: &[&str]) -> Option<String> {
    let lowered: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
    DOMAIN_KEYWORDS
        .iter()
        .map(|(domain, keywords)| {
            let hits = lowered
                .iter()
                .filter(|w| keywords.contains(&w.as_str()))
                .count();
            (*domain, hits)
        })
        .filter(|(_, hits)| *hits >= DOMAIN_MIN_HITS)
        .max_by_key(|(_, hits)| *hits)
        .map(|(domain, _)| domain.to_string())
}

/// Compute path chosen for an embedding request that missed the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedStrategy {
    /// Fast local backend, no cache write-back.
    Local,
    /// Fast local backend, result cached after.
    LocalThenCache,
    /// Remote domain-expert model.
    Domain(String),
    /// Remote model (premium or default), result cached after.
    Remote(String),
    /// Average of registered local backends, cached after.
    Ensemble,
}

/// Dependency health inputs to a routing decision.
#[derive(Debug, Clone, Copy)]
pub struct RouteHealth {
    pub provider: BreakerState,
    /// Whether any local embedding backend is registered.
    pub has_local: bool,
}

/// The routing table plus the catalog it validates against.
pub struct Router {
    catalog: ModelCatalog,
    default_embedding_model: String,
}

impl Router {
    pub fn new(catalog: ModelCatalog, default_embedding_model: impl Into<String>) -> Self {
        Self {
            catalog,
            default_embedding_model: default_embedding_model.into(),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Pick the compute path for an embedding cache miss.
    pub fn route_embedding(
        &self,
        request: &EmbedRequest,
        analysis: &TextAnalysis,
        health: RouteHealth,
    ) -> Result<EmbedStrategy> {
        let strategy = self.preferred_strategy(request, analysis, health);
        let strategy = self.degrade_for_health(strategy, health)?;
        debug!(
            complexity = analysis.complexity,
            length = analysis.length,
            domain = analysis.domain.as_deref().unwrap_or("-"),
            strategy = ?strategy,
            "routed embedding request"
        );
        Ok(strategy)
    }

    fn preferred_strategy(
        &self,
        request: &EmbedRequest,
        analysis: &TextAnalysis,
        health: RouteHealth,
    ) -> EmbedStrategy {
        let complexity = analysis.complexity;

        if health.has_local
            && complexity < SIMPLE_COMPLEXITY
            && analysis.length < SHORT_TEXT_LEN
            && !request.require_high_quality
        {
            return EmbedStrategy::Local;
        }

        if let Some(domain) = &analysis.domain
            && let Some(expert) = self.catalog.domain_expert(domain)
        {
            return EmbedStrategy::Domain(expert.id.clone());
        }

        if complexity > COMPLEX_COMPLEXITY || request.require_high_quality {
            // Near the boundary the cheaper path wins, unless quality was
            // explicitly required.
            let near_boundary = (complexity - COMPLEX_COMPLEXITY).abs() < TIE_BREAK_MARGIN;
            if !(near_boundary && !request.require_high_quality && health.has_local) {
                return EmbedStrategy::Remote(self.premium_or_default());
            }
        }

        if request.latency_sensitive && health.has_local {
            return EmbedStrategy::LocalThenCache;
        }

        if health.has_local {
            EmbedStrategy::Ensemble
        } else {
            EmbedStrategy::Remote(self.default_embedding_model.clone())
        }
    }

    /// Prefer the healthier dependency: a remote strategy under an open
    /// breaker degrades to local when possible, errors when not.
    fn degrade_for_health(
        &self,
        strategy: EmbedStrategy,
        health: RouteHealth,
    ) -> Result<EmbedStrategy> {
        let remote = matches!(
            strategy,
            EmbedStrategy::Domain(_) | EmbedStrategy::Remote(_)
        );
        if !remote || health.provider != BreakerState::Open {
            return Ok(strategy);
        }
        if health.has_local {
            Ok(EmbedStrategy::LocalThenCache)
        } else {
            Err(MimirError::DependencyOpen {
                dependency: "provider".into(),
            })
        }
    }

    fn premium_or_default(&self) -> String {
        self.catalog
            .premium_embedding()
            .map(|m| m.id.clone())
            .unwrap_or_else(|| self.default_embedding_model.clone())
    }

    /// The catalogued spec for an embedding model id, defaulting when the
    /// request names none.
    pub fn embedding_spec(&self, model_id: Option<&str>) -> Result<&ModelSpec> {
        let id = model_id.unwrap_or(&self.default_embedding_model);
        let spec = self.catalog.require(id)?;
        if !spec.family().is_some_and(|f| f.is_embedding()) {
            return Err(MimirError::Client(format!("{id} is not an embedding model")));
        }
        Ok(spec)
    }

    /// Validate a generation request and clamp its token budget to the
    /// family cap.
    pub fn route_generation(&self, model_id: &str, max_tokens: u32) -> Result<(&ModelSpec, u32)> {
        let spec = self.catalog.require(model_id)?;
        if spec.family().is_some_and(|f| f.is_embedding()) {
            return Err(MimirError::Client(format!(
                "{model_id} is an embedding model, not a generation model"
            )));
        }
        if max_tokens == 0 {
            return Err(MimirError::Client("max_tokens must be at least 1".into()));
        }
        Ok((spec, max_tokens.min(spec.max_tokens)))
    }
}
