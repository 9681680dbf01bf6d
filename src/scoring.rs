//! Scoring engine: concurrent detector fan-out and weighted aggregation
//!
//! Every registered detector runs on the blocking pool against the same
//! immutable bars and context. Failures, panics and timeouts are folded into
//! neutral components, so one broken detector degrades the score instead of
//! blocking it. Aggregation itself is a pure function of the components.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    validate_series, Bar, BuiltinDetector, ContextProvider, DefaultContextProvider,
    DetectionResult, Direction, Meta, Result, ScoringContext, SignalDetector, SignalError,
};

/// Allowed drift of the weight sum from 1.0
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

pub const DEFAULT_DETECTOR_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================
// WEIGHTS
// ============================================================

/// Per-detector weights. Always non-negative and summing to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct WeightConfig {
    weights: BTreeMap<String, f64>,
}

impl WeightConfig {
    pub fn new<I, K>(weights: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let config = Self {
            weights: weights.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, &value) in &self.weights {
            if !value.is_finite() || value < 0.0 {
                return Err(SignalError::NegativeWeight {
                    name: name.clone(),
                    value,
                });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE + f64::EPSILON {
            return Err(SignalError::InvalidWeights { sum });
        }
        Ok(())
    }

    /// Every detector has a weight and every weight has a detector
    pub fn check_coverage<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let names: Vec<&str> = names.into_iter().collect();
        if let Some(missing) = names.iter().find(|n| !self.weights.contains_key(**n)) {
            return Err(SignalError::MissingWeight(missing.to_string()));
        }
        if let Some(extra) = self.weights.keys().find(|k| !names.contains(&k.as_str())) {
            return Err(SignalError::UnknownDetector(extra.clone()));
        }
        Ok(())
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.weights.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        WeightPreset::Balanced.weights()
    }
}

impl TryFrom<BTreeMap<String, f64>> for WeightConfig {
    type Error = SignalError;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self> {
        Self::new(map)
    }
}

impl From<WeightConfig> for BTreeMap<String, f64> {
    fn from(config: WeightConfig) -> Self {
        config.weights
    }
}

/// Named weight sets for the builtin detectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightPreset {
    Balanced,
    /// Leans on market structure (SMC)
    Structure,
    /// Leans on price geometry (harmonic, Elliott)
    Geometric,
}

impl WeightPreset {
    pub const ALL: [WeightPreset; 3] = [
        WeightPreset::Balanced,
        WeightPreset::Structure,
        WeightPreset::Geometric,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WeightPreset::Balanced => "balanced",
            WeightPreset::Structure => "structure",
            WeightPreset::Geometric => "geometric",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| SignalError::InvalidConfig(format!("unknown weight preset: {name}")))
    }

    pub fn weights(self) -> WeightConfig {
        let (harmonic, elliott, smc) = match self {
            WeightPreset::Balanced => (0.35, 0.30, 0.35),
            WeightPreset::Structure => (0.25, 0.20, 0.55),
            WeightPreset::Geometric => (0.40, 0.40, 0.20),
        };
        let weights = [("harmonic", harmonic), ("elliott", elliott), ("smc", smc)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        WeightConfig { weights }
    }
}

// ============================================================
// ADVICE
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advice {
    HighDisagreement,
    LowConfidence,
    StrongBuy,
    Buy,
    WeakBuy,
    StrongSell,
    Sell,
    WeakSell,
    HoldBullish,
    HoldBearish,
    HoldNeutral,
}

impl Advice {
    pub fn label(self) -> &'static str {
        match self {
            Advice::HighDisagreement => "HIGH_DISAGREEMENT",
            Advice::LowConfidence => "LOW_CONFIDENCE",
            Advice::StrongBuy => "STRONG_BUY",
            Advice::Buy => "BUY",
            Advice::WeakBuy => "WEAK_BUY",
            Advice::StrongSell => "STRONG_SELL",
            Advice::Sell => "SELL",
            Advice::WeakSell => "WEAK_SELL",
            Advice::HoldBullish => "HOLD_BULLISH",
            Advice::HoldBearish => "HOLD_BEARISH",
            Advice::HoldNeutral => "HOLD_NEUTRAL",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Advice::HighDisagreement => "Wait for clearer signals",
            Advice::LowConfidence => "Consider waiting for better setup",
            Advice::StrongBuy => "High confidence bullish signal",
            Advice::Buy => "Moderate bullish signal",
            Advice::WeakBuy => "Low confidence bullish signal",
            Advice::StrongSell => "High confidence bearish signal",
            Advice::Sell => "Moderate bearish signal",
            Advice::WeakSell => "Low confidence bearish signal",
            Advice::HoldBullish => "Slight bullish bias",
            Advice::HoldBearish => "Slight bearish bias",
            Advice::HoldNeutral => "No clear direction",
        }
    }

    /// Wait-type advice: the detectors do not support acting
    pub fn is_wait(self) -> bool {
        matches!(self, Advice::HighDisagreement | Advice::LowConfidence)
    }
}

impl fmt::Display for Advice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.label(), self.description())
    }
}

/// Cut-offs used when turning an aggregate into advice
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdviceThresholds {
    pub max_disagreement: f64,
    pub min_confidence: f64,
    /// |score| above this is a strong buy/sell
    pub strong: f64,
    /// |score| above this is a plain buy/sell
    pub moderate: f64,
    /// |score| above this gives a neutral call a lean
    pub hold_bias: f64,
    /// One side's mass must exceed the other's by this factor to set direction
    pub direction_margin: f64,
}

impl Default for AdviceThresholds {
    fn default() -> Self {
        Self {
            max_disagreement: 0.7,
            min_confidence: 0.4,
            strong: 0.8,
            moderate: 0.65,
            hold_bias: 0.2,
            direction_margin: 1.2,
        }
    }
}

impl AdviceThresholds {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            self.max_disagreement,
            self.min_confidence,
            self.strong,
            self.moderate,
            self.hold_bias,
        ];
        if fields.iter().any(|v| !v.is_finite() || !(0.0..=1.0).contains(v)) {
            return Err(SignalError::InvalidConfig(
                "advice thresholds must lie in [0, 1]".into(),
            ));
        }
        if self.moderate > self.strong {
            return Err(SignalError::InvalidConfig(
                "advice moderate threshold exceeds strong threshold".into(),
            ));
        }
        if !self.direction_margin.is_finite() || self.direction_margin < 1.0 {
            return Err(SignalError::InvalidConfig(
                "direction_margin must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================
// SCORES
// ============================================================

/// One detector's share of a combined score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    pub detector: String,
    pub weight: f64,
    pub score: f64,
    pub direction: Direction,
    pub confidence: f64,
    /// score × weight
    pub contribution: f64,
    pub meta: Meta,
}

impl ComponentScore {
    pub fn new(detector: impl Into<String>, weight: f64, result: DetectionResult) -> Self {
        Self {
            detector: detector.into(),
            weight,
            score: result.score,
            direction: result.direction,
            confidence: result.confidence,
            contribution: result.score * weight,
            meta: result.meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedScore {
    pub final_score: f64,
    pub direction: Direction,
    pub advice: Advice,
    pub confidence: f64,
    pub bull_mass: f64,
    pub bear_mass: f64,
    pub disagreement: f64,
    pub components: Vec<ComponentScore>,
}

impl CombinedScore {
    pub fn component(&self, detector: &str) -> Option<&ComponentScore> {
        self.components.iter().find(|c| c.detector == detector)
    }

    /// "LABEL - description"
    pub fn advice_text(&self) -> String {
        self.advice.to_string()
    }
}

// ============================================================
// AGGREGATION
// ============================================================

/// Fold weighted components into one score with advice
pub fn aggregate(components: Vec<ComponentScore>, thresholds: &AdviceThresholds) -> CombinedScore {
    let final_score = components
        .iter()
        .map(|c| c.contribution)
        .sum::<f64>()
        .clamp(-1.0, 1.0);

    let (bull, bear) = direction_mass(&components);
    let direction = overall_direction(bull, bear, thresholds.direction_margin);
    let confidence = weighted_confidence(&components);
    let (bull_mass, bear_mass) = normalize_mass(bull, bear);
    let disagreement = disagreement(&components);
    let advice = derive_advice(final_score, direction, confidence, disagreement, thresholds);

    CombinedScore {
        final_score,
        direction,
        advice,
        confidence,
        bull_mass,
        bear_mass,
        disagreement,
        components,
    }
}

/// Sum of |contribution| per side
pub fn direction_mass(components: &[ComponentScore]) -> (f64, f64) {
    components
        .iter()
        .fold((0.0, 0.0), |(bull, bear), c| match c.direction {
            Direction::Bullish => (bull + c.contribution.abs(), bear),
            Direction::Bearish => (bull, bear + c.contribution.abs()),
            Direction::Neutral => (bull, bear),
        })
}

pub fn overall_direction(bull: f64, bear: f64, margin: f64) -> Direction {
    if bull > bear * margin {
        Direction::Bullish
    } else if bear > bull * margin {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// Shares of the two sides; both zero when neither side has mass
pub fn normalize_mass(bull: f64, bear: f64) -> (f64, f64) {
    let total = bull + bear;
    if total > 0.0 {
        (bull / total, bear / total)
    } else {
        (0.0, 0.0)
    }
}

/// Confidence averaged by |contribution|, 0.5 when nothing contributes
pub fn weighted_confidence(components: &[ComponentScore]) -> f64 {
    let total: f64 = components.iter().map(|c| c.contribution.abs()).sum();
    if total <= 0.0 {
        return 0.5;
    }
    let weighted: f64 = components
        .iter()
        .map(|c| c.confidence * c.contribution.abs())
        .sum();
    (weighted / total).clamp(0.0, 1.0)
}

/// Normalized entropy of direction labels scaled by (1 - mean confidence)
pub fn disagreement(components: &[ComponentScore]) -> f64 {
    if components.len() < 2 {
        return 0.0;
    }

    let mut counts: HashMap<Direction, usize> = HashMap::new();
    for c in components {
        *counts.entry(c.direction).or_default() += 1;
    }
    if counts.len() < 2 {
        return 0.0;
    }

    let total = components.len() as f64;
    let entropy: f64 = counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum();
    let normalized = entropy / (counts.len() as f64).log2();

    let mean_confidence = components.iter().map(|c| c.confidence).sum::<f64>() / total;
    (normalized * (1.0 - mean_confidence)).clamp(0.0, 1.0)
}

pub fn derive_advice(
    score: f64,
    direction: Direction,
    confidence: f64,
    disagreement: f64,
    t: &AdviceThresholds,
) -> Advice {
    if disagreement > t.max_disagreement {
        return Advice::HighDisagreement;
    }
    if confidence < t.min_confidence {
        return Advice::LowConfidence;
    }

    match direction {
        Direction::Bullish if score > t.strong => Advice::StrongBuy,
        Direction::Bullish if score > t.moderate => Advice::Buy,
        Direction::Bullish => Advice::WeakBuy,
        Direction::Bearish if score < -t.strong => Advice::StrongSell,
        Direction::Bearish if score < -t.moderate => Advice::Sell,
        Direction::Bearish => Advice::WeakSell,
        Direction::Neutral if score > t.hold_bias => Advice::HoldBullish,
        Direction::Neutral if score < -t.hold_bias => Advice::HoldBearish,
        Direction::Neutral => Advice::HoldNeutral,
    }
}

// ============================================================
// BAR SOURCE
// ============================================================

pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Market-data collaborator supplying ordered bars for a symbol
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Bar>, SourceError>;
}

// ============================================================
// ENGINE
// ============================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-detector wall-clock budget on the async path
    pub detector_timeout: Duration,
    /// Score invalid series as empty instead of feeding them to detectors
    pub validate_data: bool,
    pub thresholds: AdviceThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector_timeout: DEFAULT_DETECTOR_TIMEOUT,
            validate_data: true,
            thresholds: AdviceThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorStatus {
    pub name: String,
    pub weight: f64,
    pub min_bars: usize,
    pub active: bool,
}

pub struct ScoringEngine {
    detectors: Vec<Arc<dyn SignalDetector>>,
    weights: RwLock<Arc<WeightConfig>>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    config: EngineConfig,
}

impl fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringEngine")
            .field("detectors", &self.detector_names())
            .field("weights", &self.weights())
            .field("config", &self.config)
            .finish()
    }
}

impl ScoringEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Current weights. Each scoring call works from one snapshot.
    pub fn weights(&self) -> Arc<WeightConfig> {
        Arc::clone(&self.weights.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in new weights. Rejected weights leave the old ones in place.
    pub fn update_weights(&self, weights: WeightConfig) -> Result<()> {
        weights.validate()?;
        weights.check_coverage(self.detector_names())?;
        info!(weights = ?weights, "detector weights updated");
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(weights);
        Ok(())
    }

    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn detector_status(&self) -> Vec<DetectorStatus> {
        let weights = self.weights();
        self.detectors
            .iter()
            .map(|d| DetectorStatus {
                name: d.name().to_string(),
                weight: weights.get(d.name()).unwrap_or(0.0),
                min_bars: d.min_bars(),
                active: true,
            })
            .collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every detector concurrently and aggregate.
    ///
    /// Never fails: data problems, detector errors, panics and timeouts all
    /// surface as neutral components with `meta["error"]` set.
    pub async fn score(&self, bars: &[Bar], ctx: &ScoringContext) -> CombinedScore {
        let weights = self.weights();
        let (bars, ctx) = self.prepare(bars, ctx);
        let results = self.run_detectors(bars, ctx).await;
        self.combine(&weights, results)
    }

    /// Like [`ScoringEngine::score`] but abandons the call once `cancel` fires.
    ///
    /// Outstanding detector tasks are aborted with the dropped task set.
    pub async fn score_with_cancel(
        &self,
        bars: &[Bar],
        ctx: &ScoringContext,
        cancel: &CancellationToken,
    ) -> Result<CombinedScore> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("scoring cancelled");
                Err(SignalError::Cancelled)
            }

            combined = self.score(bars, ctx) => Ok(combined),
        }
    }

    /// Fetch bars through `source` and score them.
    ///
    /// A failed fetch is scored as an empty series.
    pub async fn score_symbol(
        &self,
        source: &dyn BarSource,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        ctx: &ScoringContext,
    ) -> CombinedScore {
        let bars = match source.fetch_bars(symbol, timeframe, limit).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, timeframe, error = %e, "bar fetch failed, scoring empty series");
                Vec::new()
            }
        };
        self.score(&bars, ctx).await
    }

    /// Sequential scoring on the current thread. No per-detector timeout.
    pub fn score_blocking(&self, bars: &[Bar], ctx: &ScoringContext) -> CombinedScore {
        let weights = self.weights();
        let (bars, ctx) = self.prepare(bars, ctx);
        let results = self
            .detectors
            .iter()
            .map(|d| d.evaluate(&bars, &ctx))
            .collect();
        self.combine(&weights, results)
    }

    fn prepare(&self, bars: &[Bar], ctx: &ScoringContext) -> (Arc<[Bar]>, Arc<ScoringContext>) {
        let bars: &[Bar] = if self.config.validate_data {
            match validate_series(bars) {
                Ok(()) => bars,
                Err(e) => {
                    warn!(error = %e, bars = bars.len(), "invalid bar series, scoring as empty");
                    &[]
                }
            }
        } else {
            bars
        };

        let mut ctx = ctx.clone();
        if let Some(provider) = &self.context_provider {
            provider.enrich(bars, &mut ctx);
        }
        (Arc::from(bars), Arc::new(ctx))
    }

    async fn run_detectors(
        &self,
        bars: Arc<[Bar]>,
        ctx: Arc<ScoringContext>,
    ) -> Vec<DetectionResult> {
        let timeout = self.config.detector_timeout;
        let mut tasks = JoinSet::new();

        for (slot, detector) in self.detectors.iter().enumerate() {
            let detector = Arc::clone(detector);
            let bars = Arc::clone(&bars);
            let ctx = Arc::clone(&ctx);

            tasks.spawn(async move {
                let name = detector.name().to_string();
                let job = tokio::task::spawn_blocking(move || detector.evaluate(&bars, &ctx));

                let result = match tokio::time::timeout(timeout, job).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) if e.is_panic() => {
                        warn!(detector = %name, "detector task panicked");
                        DetectionResult::failed("detector panicked")
                    }
                    Ok(Err(e)) => {
                        warn!(detector = %name, error = %e, "detector task failed");
                        DetectionResult::failed(format!("detector task failed: {e}"))
                    }
                    Err(_) => {
                        let ms = timeout.as_millis() as u64;
                        warn!(detector = %name, timeout_ms = ms, "detector timed out");
                        DetectionResult::failed(format!("detector timed out after {ms} ms"))
                    }
                };
                (slot, result)
            });
        }

        let mut results: Vec<Option<DetectionResult>> =
            (0..self.detectors.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => warn!(error = %e, "detector join failed"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| DetectionResult::failed("detector task aborted")))
            .collect()
    }

    fn combine(&self, weights: &WeightConfig, results: Vec<DetectionResult>) -> CombinedScore {
        let components = self
            .detectors
            .iter()
            .zip(results)
            .map(|(d, r)| ComponentScore::new(d.name(), weights.get(d.name()).unwrap_or(0.0), r))
            .collect();

        let combined = aggregate(components, &self.config.thresholds);
        debug!(
            final_score = combined.final_score,
            direction = %combined.direction,
            confidence = combined.confidence,
            disagreement = combined.disagreement,
            advice = combined.advice.label(),
            "scored"
        );
        combined
    }
}

// ============================================================
// BUILDER
// ============================================================

pub struct EngineBuilder {
    detectors: Vec<Arc<dyn SignalDetector>>,
    weights: Option<WeightConfig>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
            weights: None,
            context_provider: None,
            config: EngineConfig::default(),
        }
    }

    /// Add the harmonic, Elliott and SMC detectors with default parameters
    pub fn with_all_defaults(mut self) -> Self {
        self.detectors.extend(
            BuiltinDetector::all_defaults()
                .into_iter()
                .map(|d| Arc::new(d) as Arc<dyn SignalDetector>),
        );
        self
    }

    /// Add a builtin detector
    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, detector: BuiltinDetector) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    /// Add with config validation
    pub fn add_checked(mut self, detector: BuiltinDetector) -> Result<Self> {
        detector.validate_config()?;
        self.detectors.push(Arc::new(detector));
        Ok(self)
    }

    /// Add a caller-supplied detector
    pub fn add_custom<D: SignalDetector + 'static>(mut self, detector: D) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    pub fn weights(mut self, weights: WeightConfig) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn preset(self, preset: WeightPreset) -> Self {
        self.weights(preset.weights())
    }

    pub fn context_provider<P: ContextProvider + 'static>(mut self, provider: P) -> Self {
        self.context_provider = Some(Arc::new(provider));
        self
    }

    /// Derive missing RSI and trend from the bars
    pub fn derive_context(self) -> Self {
        self.context_provider(DefaultContextProvider::default())
    }

    pub fn detector_timeout(mut self, timeout: Duration) -> Self {
        self.config.detector_timeout = timeout;
        self
    }

    /// Enable/disable data validation
    pub fn validate_data(mut self, enable: bool) -> Self {
        self.config.validate_data = enable;
        self
    }

    pub fn thresholds(mut self, thresholds: AdviceThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    /// Build the engine. Every configuration error surfaces here.
    pub fn build(self) -> Result<ScoringEngine> {
        if self.detectors.is_empty() {
            return Err(SignalError::InvalidConfig("no detectors registered".into()));
        }
        if self.config.detector_timeout.is_zero() {
            return Err(SignalError::InvalidConfig(
                "detector_timeout must be positive".into(),
            ));
        }
        self.config.thresholds.validate()?;

        let mut seen = HashSet::new();
        for detector in &self.detectors {
            detector.validate_config()?;
            if !seen.insert(detector.name()) {
                return Err(SignalError::DuplicateDetector(detector.name().to_string()));
            }
        }

        let weights = self.weights.unwrap_or_default();
        weights.validate()?;
        weights.check_coverage(self.detectors.iter().map(|d| d.name()))?;

        info!(
            detectors = self.detectors.len(),
            timeout_ms = self.config.detector_timeout.as_millis() as u64,
            derive_context = self.context_provider.is_some(),
            "scoring engine built"
        );

        Ok(ScoringEngine {
            detectors: self.detectors,
            weights: RwLock::new(Arc::new(weights)),
            context_provider: self.context_provider,
            config: self.config,
        })
    }
}

// ============================================================
// PARALLEL SCANNING
// ============================================================

/// Filter applied to batch scan results
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRule {
    pub min_abs_score: f64,
    pub min_confidence: f64,
}

impl ScanRule {
    pub fn matches(&self, combined: &CombinedScore) -> bool {
        combined.final_score.abs() >= self.min_abs_score
            && combined.confidence >= self.min_confidence
    }
}

/// Result of scoring a single instrument
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub symbol: String,
    pub score: CombinedScore,
}

/// Score many instruments on the rayon pool.
///
/// Results passing `rule` come back strongest first (by |final_score|).
pub fn scan_parallel<'a, I>(
    engine: &ScoringEngine,
    instruments: I,
    ctx: &ScoringContext,
    rule: &ScanRule,
) -> Vec<ScanResult>
where
    I: IntoParallelIterator<Item = (&'a str, &'a [Bar])>,
{
    let mut results: Vec<ScanResult> = instruments
        .into_par_iter()
        .map(|(symbol, bars)| ScanResult {
            symbol: symbol.to_string(),
            score: engine.score_blocking(bars, ctx),
        })
        .filter(|r| rule.matches(&r.score))
        .collect();

    results.sort_by(|a, b| {
        b.score
            .final_score
            .abs()
            .total_cmp(&a.score.final_score.abs())
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    results
}

// ============================================================
// TESTS
// ============================================================
