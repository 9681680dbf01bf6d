//! # Confluence - multi-detector signal scoring
//!
//! Independent pattern detectors (harmonic, Elliott wave, smart money concepts)
//! each read a price history and emit a signed score in `[-1, 1]`. The
//! [`ScoringEngine`] runs them concurrently and folds their results into one
//! weighted [`CombinedScore`] with advice attached.
//!
//! ## Quick Start
//!
//! ```rust
//! use confluence::prelude::*;
//!
//! let bars: Vec<Bar> = (0..200)
//!     .map(|i| {
//!         let c = 100.0 + (i as f64 * 0.3).sin() * 5.0;
//!         Bar::new(c, c + 1.0, c - 1.0, c, 1_000.0)
//!     })
//!     .collect();
//!
//! let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let combined = runtime.block_on(engine.score(&bars, &ScoringContext::default()));
//!
//! assert_eq!(combined.components.len(), 3);
//! assert!((-1.0..=1.0).contains(&combined.final_score));
//! ```

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use serde_json::{json, Value};

pub mod config;
pub mod detectors;
pub mod params;
pub mod scoring;
pub mod swing;

pub use scoring::{
    scan_parallel, Advice, AdviceThresholds, BarSource, CombinedScore, ComponentScore,
    DetectorStatus, EngineBuilder, EngineConfig, ScanResult, ScanRule, ScoringEngine,
    WeightConfig, WeightPreset,
};

pub mod prelude {
    pub use crate::{
        // Configuration
        config::ScoringConfig,
        // Detectors
        detectors::{ElliottDetector, HarmonicDetector, HarmonicKind, SmcDetector},
        // Parameters
        params::{ParamMeta, ParamType, ParameterizedDetector},
        // Scoring
        scan_parallel,
        // Swing points
        swing::{extract_pivots, Pivot, PivotKind, SwingExtractor},
        Advice,
        AdviceThresholds,
        // Types
        Bar,
        BarSource,
        BuiltinDetector,
        CombinedScore,
        ComponentScore,
        ContextProvider,
        DefaultContextProvider,
        DetectionResult,
        Direction,
        EngineBuilder,
        Meta,
        OHLCVExt,
        Period,
        Ratio,
        Result,
        ScanResult,
        ScanRule,
        ScoringContext,
        ScoringEngine,
        // Core traits
        SignalDetector,
        // Errors
        SignalError,
        Trend,
        WeightConfig,
        WeightPreset,
        OHLCV,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, SignalError>;

/// Errors raised by detectors, the engine and configuration loading.
///
/// Only configuration errors and cancellation ever reach callers of the
/// engine. Everything data-dependent is folded into neutral results.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Weights must sum to 1.0, got {sum}")]
    InvalidWeights { sum: f64 },

    #[error("Weight for {name} must be finite and non-negative, got {value}")]
    NegativeWeight { name: String, value: f64 },

    #[error("No weight configured for detector {0}")]
    MissingWeight(String),

    #[error("Unknown detector: {0}")]
    UnknownDetector(String),

    #[error("Detector registered twice: {0}")]
    DuplicateDetector(String),

    #[error("Insufficient data: need {need} bars, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),

    #[error("Invalid OHLCV at index {index}: {reason}")]
    InvalidOHLCV { index: usize, reason: &'static str },

    #[error("Scoring cancelled")]
    Cancelled,

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Fraction in `0.0..=1.0`: weights, proximity bands, minimum moves
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Ratio(f64);

impl Ratio {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(SignalError::InvalidValue("ratio must be finite"));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(SignalError::OutOfRange {
                field: "ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    /// Unchecked constructor for literal defaults
    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Ratio {
    type Error = SignalError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Ratio> for f64 {
    fn from(ratio: Ratio) -> Self {
        ratio.0
    }
}

/// Non-zero bar count: lookbacks, neighborhoods, minimum history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Period(usize);

impl Period {
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(SignalError::InvalidValue("period must be at least one bar"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for Period {
    type Error = SignalError;

    fn try_from(value: usize) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Period> for usize {
    fn from(period: Period) -> Self {
        period.0
    }
}

// ============================================================
// OHLCV TRAITS
// ============================================================

/// Core OHLCV data trait
pub trait OHLCV {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;

    fn timestamp(&self) -> Option<i64> {
        None
    }
}

/// Extension trait with computed properties for OHLCV data
pub trait OHLCVExt: OHLCV {
    #[inline]
    fn body(&self) -> f64 {
        (self.close() - self.open()).abs()
    }

    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    #[inline]
    fn is_bearish(&self) -> bool {
        self.close() < self.open()
    }

    /// Body move relative to the open. Returns None if open ≈ 0
    #[inline]
    fn body_move(&self) -> Option<f64> {
        let open = self.open();
        (open.abs() > f64::EPSILON).then(|| (self.close() - open).abs() / open)
    }

    /// Validate OHLCV data consistency
    fn validate(&self) -> Result<()> {
        let prices = [self.open(), self.high(), self.low(), self.close()];
        if prices.iter().any(|p| p.is_nan()) {
            return Err(SignalError::InvalidOHLCV {
                index: 0,
                reason: "NaN in OHLCV",
            });
        }
        if prices.iter().any(|p| p.is_infinite()) {
            return Err(SignalError::InvalidOHLCV {
                index: 0,
                reason: "Infinite value in OHLCV",
            });
        }
        if prices.iter().any(|&p| p <= 0.0) {
            return Err(SignalError::InvalidOHLCV {
                index: 0,
                reason: "non-positive price",
            });
        }
        if self.high() < self.low() {
            return Err(SignalError::InvalidOHLCV {
                index: 0,
                reason: "high < low",
            });
        }
        if !self.volume().is_finite() || self.volume() < 0.0 {
            return Err(SignalError::InvalidOHLCV {
                index: 0,
                reason: "negative or non-finite volume",
            });
        }
        Ok(())
    }
}

impl<T: OHLCV> OHLCVExt for T {}

/// Validate every bar plus timestamp ordering across the series.
pub fn validate_series<T: OHLCV>(bars: &[T]) -> Result<()> {
    let mut last_ts: Option<i64> = None;
    for (i, bar) in bars.iter().enumerate() {
        bar.validate().map_err(|e| match e {
            SignalError::InvalidOHLCV { reason, .. } => SignalError::InvalidOHLCV { index: i, reason },
            other => other,
        })?;
        if let Some(ts) = bar.timestamp() {
            if last_ts.is_some_and(|prev| ts < prev) {
                return Err(SignalError::InvalidOHLCV {
                    index: i,
                    reason: "timestamp goes backwards",
                });
            }
            last_ts = Some(ts);
        }
    }
    Ok(())
}

/// One OHLCV sample.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Unix milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

impl Bar {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open,
            high,
            low,
            close,
            volume,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl OHLCV for Bar {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn timestamp(&self) -> Option<i64> {
        Some(self.timestamp)
    }
}

// ============================================================
// DIRECTION / TREND
// ============================================================

/// Directional bias of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Bullish,
    Neutral,
    Bearish,
}

impl Direction {
    /// Direction implied by the sign of a signed score
    #[inline]
    pub fn from_score(score: f64) -> Self {
        if score > 0.0 {
            Direction::Bullish
        } else if score < 0.0 {
            Direction::Bearish
        } else {
            Direction::Neutral
        }
    }

    #[inline]
    pub fn is_bullish(self) -> bool {
        matches!(self, Direction::Bullish)
    }

    #[inline]
    pub fn is_bearish(self) -> bool {
        matches!(self, Direction::Bearish)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Bullish => "BULLISH",
            Direction::Neutral => "NEUTRAL",
            Direction::Bearish => "BEARISH",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market trend label supplied by the caller (or derived from bars)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Sideways,
}

impl Trend {
    #[inline]
    pub fn is_up(self) -> bool {
        matches!(self, Trend::Up)
    }

    #[inline]
    pub fn is_down(self) -> bool {
        matches!(self, Trend::Down)
    }
}

impl From<&str> for Trend {
    /// "up" and "down" map to their variants, anything else is sideways.
    fn from(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "up" => Trend::Up,
            "down" => Trend::Down,
            _ => Trend::Sideways,
        }
    }
}

impl<'de> serde::Deserialize<'de> for Trend {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let label = String::deserialize(d)?;
        Ok(Trend::from(label.as_str()))
    }
}

// ============================================================
// SCORING CONTEXT
// ============================================================

/// Open key-value bag of side information for one scoring call.
///
/// `rsi` and `trend` are read by the builtin detectors; `extra` carries
/// detector-specific keys untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoringContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
    #[serde(flatten)]
    pub extra: Meta,
}

impl ScoringContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a loose map, lifting `rsi` and `trend` into typed fields.
    pub fn from_map(mut map: Meta) -> Self {
        let rsi = map.remove("rsi").and_then(|v| v.as_f64());
        let trend = map
            .remove("trend")
            .and_then(|v| v.as_str().map(Trend::from));
        Self {
            rsi,
            trend,
            extra: map,
        }
    }

    pub fn with_rsi(mut self, rsi: f64) -> Self {
        self.rsi = Some(rsi);
        self
    }

    pub fn with_trend(mut self, trend: Trend) -> Self {
        self.trend = Some(trend);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Fills in context fields the caller left empty
pub trait ContextProvider: Send + Sync {
    fn enrich(&self, bars: &[Bar], ctx: &mut ScoringContext);
}

/// Derives RSI (Wilder smoothing) and a trend label from the bars themselves
#[derive(Debug, Clone)]
pub struct DefaultContextProvider {
    pub rsi_period: Period,
    pub trend_period: Period,
    /// Fractional change over `trend_period` that counts as a trend
    pub trend_threshold: Ratio,
}

impl Default for DefaultContextProvider {
    fn default() -> Self {
        Self {
            rsi_period: Period::new_const(14),
            trend_period: Period::new_const(14),
            trend_threshold: Ratio::new_const(0.02),
        }
    }
}

impl ContextProvider for DefaultContextProvider {
    fn enrich(&self, bars: &[Bar], ctx: &mut ScoringContext) {
        if ctx.rsi.is_none() {
            ctx.rsi = self.compute_rsi(bars);
        }
        if ctx.trend.is_none() {
            ctx.trend = self.compute_trend(bars);
        }
    }
}

impl DefaultContextProvider {
    /// Wilder RSI over the whole series. None until `rsi_period + 1` closes exist.
    pub fn compute_rsi<T: OHLCV>(&self, bars: &[T]) -> Option<f64> {
        let period = self.rsi_period.get();
        if bars.len() <= period {
            return None;
        }

        let changes: Vec<f64> = bars
            .windows(2)
            .map(|w| w[1].close() - w[0].close())
            .collect();

        let (seed_gain, seed_loss) = changes[..period]
            .iter()
            .fold((0.0, 0.0), |(g, l), &c| (g + c.max(0.0), l + (-c).max(0.0)));
        let p = period as f64;
        let mut avg_gain = seed_gain / p;
        let mut avg_loss = seed_loss / p;

        for &change in &changes[period..] {
            avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
            avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
        }

        if avg_loss <= f64::EPSILON {
            return Some(if avg_gain <= f64::EPSILON { 50.0 } else { 100.0 });
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    pub fn compute_trend<T: OHLCV>(&self, bars: &[T]) -> Option<Trend> {
        let period = self.trend_period.get();
        if bars.len() <= period {
            return None;
        }

        let last = bars.len() - 1;
        let first_close = bars[last - period].close();
        let last_close = bars[last].close();

        if first_close <= f64::EPSILON {
            return Some(Trend::Sideways);
        }

        let change = (last_close - first_close) / first_close;
        let threshold = self.trend_threshold.get();

        Some(match change {
            c if c > threshold => Trend::Up,
            c if c < -threshold => Trend::Down,
            _ => Trend::Sideways,
        })
    }
}

// ============================================================
// DETECTION RESULT
// ============================================================

/// Diagnostic metadata attached to results - plain nested JSON data
pub type Meta = serde_json::Map<String, Value>;

/// Output of one detector run.
///
/// Score is signed: positive is bullish, negative bearish, and the
/// direction always agrees with the sign.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DetectionResult {
    pub score: f64,
    pub confidence: f64,
    pub direction: Direction,
    pub meta: Meta,
}

impl DetectionResult {
    /// Clamp score and confidence into range and derive direction from the sign.
    pub fn new(score: f64, confidence: f64, meta: Meta) -> Self {
        let score = if score.is_finite() {
            score.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            score,
            confidence,
            direction: Direction::from_score(score),
            meta,
        }
    }

    /// Zero score, zero confidence
    pub fn neutral(meta: Meta) -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            direction: Direction::Neutral,
            meta,
        }
    }

    /// Neutral result with the failure recorded under `meta["error"]`
    pub fn failed(error: impl fmt::Display) -> Self {
        let mut meta = Meta::new();
        meta.insert("error".into(), json!(error.to_string()));
        Self::neutral(meta)
    }

    pub fn error(&self) -> Option<&str> {
        self.meta.get("error").and_then(Value::as_str)
    }

    pub fn is_neutral(&self) -> bool {
        self.direction == Direction::Neutral
    }
}

impl From<SignalError> for DetectionResult {
    fn from(err: SignalError) -> Self {
        let mut result = DetectionResult::failed(&err);
        if let SignalError::InsufficientData { need, got } = err {
            result.meta.insert("insufficient_data".into(), json!(true));
            result.meta.insert("bars_required".into(), json!(need));
            result.meta.insert("bars_available".into(), json!(got));
        }
        result
    }
}

// ============================================================
// DETECTOR TRAIT
// ============================================================

/// Object-safe detector interface.
///
/// `detect` may fail; the engine always goes through [`SignalDetector::evaluate`],
/// which turns short input, errors and panics into neutral results.
pub trait SignalDetector: Send + Sync {
    fn name(&self) -> &str;
    fn min_bars(&self) -> usize;
    fn detect(&self, bars: &[Bar], ctx: &ScoringContext) -> Result<DetectionResult>;

    fn validate_config(&self) -> Result<()> {
        Ok(())
    }

    /// Run `detect` behind the failure boundary. Never panics, never errors.
    fn evaluate(&self, bars: &[Bar], ctx: &ScoringContext) -> DetectionResult {
        let need = self.min_bars();
        if bars.len() < need {
            return DetectionResult::from(SignalError::InsufficientData {
                need,
                got: bars.len(),
            });
        }

        match catch_unwind(AssertUnwindSafe(|| self.detect(bars, ctx))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(detector = self.name(), error = %err, "detector failed, neutralized");
                DetectionResult::from(err)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::warn!(detector = self.name(), %reason, "detector panicked, neutralized");
                DetectionResult::failed(format!("detector panicked: {reason}"))
            }
        }
    }
}

// ============================================================
// BUILTIN DETECTORS - generated via macro
// ============================================================

use detectors::{ElliottDetector, HarmonicDetector, SmcDetector};
use params::ParameterizedDetector;

/// Macro to generate BuiltinDetector enum without boilerplate
macro_rules! define_builtin_detectors {
    (
        $(
            $variant:ident($detector:ty)
        ),* $(,)?
    ) => {
        /// All builtin detectors - fast path via enum dispatch
        #[derive(Debug, Clone)]
        pub enum BuiltinDetector {
            $($variant($detector)),*
        }

        impl BuiltinDetector {
            /// Names of every builtin detector, in registration order
            pub fn names() -> Vec<&'static str> {
                vec![$(<$detector as ParameterizedDetector>::detector_name()),*]
            }

            /// One instance of every builtin detector with default parameters
            pub fn all_defaults() -> Vec<Self> {
                vec![$(Self::$variant(<$detector>::default())),*]
            }

            /// Build a builtin detector by name from a parameter map
            pub fn from_params(name: &str, params: &HashMap<&str, f64>) -> Result<Self> {
                $(
                    if name == <$detector as ParameterizedDetector>::detector_name() {
                        return Ok(Self::$variant(
                            <$detector as ParameterizedDetector>::with_params(params)?,
                        ));
                    }
                )*
                Err(SignalError::UnknownDetector(name.to_string()))
            }
        }

        impl SignalDetector for BuiltinDetector {
            #[inline]
            fn name(&self) -> &str {
                match self {
                    $(Self::$variant(d) => SignalDetector::name(d)),*
                }
            }

            #[inline]
            fn min_bars(&self) -> usize {
                match self {
                    $(Self::$variant(d) => SignalDetector::min_bars(d)),*
                }
            }

            fn detect(&self, bars: &[Bar], ctx: &ScoringContext) -> Result<DetectionResult> {
                match self {
                    $(Self::$variant(d) => SignalDetector::detect(d, bars, ctx)),*
                }
            }

            fn validate_config(&self) -> Result<()> {
                match self {
                    $(Self::$variant(d) => SignalDetector::validate_config(d)),*
                }
            }
        }
    };
}

define_builtin_detectors! {
    Harmonic(HarmonicDetector),
    Elliott(ElliottDetector),
    Smc(SmcDetector),
}

// ============================================================
// TESTS
// ============================================================
