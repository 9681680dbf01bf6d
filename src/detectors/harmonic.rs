//! Harmonic (XABCD) pattern detection
//!
//! Patterns: Butterfly, Bat, Gartley, Crab
//!
//! Five consecutive alternating pivots X, A, B, C, D are matched against
//! per-pattern Fibonacci ratio rules. The best valid candidate across all
//! windows and patterns becomes the signal; its quality is blended with a
//! confluence bonus from current price, RSI and trend.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;

use super::helpers::{
    clip, ensure_min_bars, mean, relative_distance, FIB_1000, FIB_1270, FIB_1618, FIB_2618,
    FIB_3618, FIB_382, FIB_500, FIB_618, FIB_786, FIB_886,
};
use crate::{
    params::{ParamMeta, ParamSet, ParameterizedDetector},
    swing::{is_alternating, Pivot, PivotKind, SwingExtractor},
    Bar, DetectionResult, Meta, Period, Ratio, Result, ScoringContext, SignalDetector,
    SignalError, Trend, OHLCV,
};

/// Projection multiples of XA measured from D
pub const TARGET_LEVELS: [f64; 4] = [FIB_382, FIB_618, FIB_1000, FIB_1618];

const CONFLUENCE_BASE: f64 = 0.5;
const NEAR_D_BONUS: f64 = 0.2;
const RSI_BONUS: f64 = 0.15;
const TREND_BONUS: f64 = 0.1;

// ============================================================
// RATIO RULES
// ============================================================

/// One Fibonacci constraint on a leg ratio
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatioRule {
    /// Relative deviation from `ideal` must stay within `tolerance`
    Target { ideal: f64, tolerance: f64 },
    /// Ratio must fall inside `[min, max]`
    Range { min: f64, max: f64 },
}

impl RatioRule {
    /// Match score in [0, 1], or None when the ratio breaks the rule
    pub fn score(self, actual: f64) -> Option<f64> {
        if !actual.is_finite() {
            return None;
        }
        match self {
            RatioRule::Target { ideal, tolerance } => {
                let deviation = (actual - ideal).abs() / ideal;
                (deviation <= tolerance).then(|| 1.0 - deviation / tolerance)
            }
            RatioRule::Range { min, max } => {
                if actual < min || actual > max {
                    return None;
                }
                let mid = (min + max) / 2.0;
                Some(1.0 - (actual - mid).abs() / (max - min))
            }
        }
    }
}

const fn target(ideal: f64, tolerance: f64) -> RatioRule {
    RatioRule::Target { ideal, tolerance }
}

const fn range(min: f64, max: f64) -> RatioRule {
    RatioRule::Range { min, max }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HarmonicKind {
    Butterfly,
    Bat,
    Gartley,
    Crab,
}

impl HarmonicKind {
    /// Scan order; earlier kinds win quality ties
    pub const ALL: [HarmonicKind; 4] = [
        HarmonicKind::Butterfly,
        HarmonicKind::Bat,
        HarmonicKind::Gartley,
        HarmonicKind::Crab,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HarmonicKind::Butterfly => "Butterfly",
            HarmonicKind::Bat => "Bat",
            HarmonicKind::Gartley => "Gartley",
            HarmonicKind::Crab => "Crab",
        }
    }

    /// Rules for `[XA_AB, AB_BC, BC_CD, XA_AD]`
    pub fn rules(self) -> [RatioRule; 4] {
        match self {
            HarmonicKind::Butterfly => [
                target(FIB_786, 0.02),
                range(FIB_382, FIB_886),
                range(FIB_1618, FIB_2618),
                range(FIB_1270, FIB_1618),
            ],
            HarmonicKind::Bat => [
                range(FIB_382, FIB_500),
                range(FIB_382, FIB_886),
                range(FIB_1618, FIB_2618),
                target(FIB_886, 0.03),
            ],
            HarmonicKind::Gartley => [
                target(FIB_618, 0.03),
                range(FIB_382, FIB_886),
                range(FIB_1270, FIB_1618),
                target(FIB_786, 0.03),
            ],
            HarmonicKind::Crab => [
                range(FIB_382, FIB_618),
                range(FIB_382, FIB_886),
                range(FIB_2618, FIB_3618),
                target(FIB_1618, 0.05),
            ],
        }
    }
}

// ============================================================
// GEOMETRY
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct XabcdPoints {
    #[serde(rename = "X")]
    pub x: Pivot,
    #[serde(rename = "A")]
    pub a: Pivot,
    #[serde(rename = "B")]
    pub b: Pivot,
    #[serde(rename = "C")]
    pub c: Pivot,
    #[serde(rename = "D")]
    pub d: Pivot,
}

impl XabcdPoints {
    /// Take five consecutive pivots. None unless exactly five are given.
    pub fn from_slice(window: &[Pivot]) -> Option<Self> {
        match *window {
            [x, a, b, c, d] => Some(Self { x, a, b, c, d }),
            _ => None,
        }
    }

    pub fn xa(&self) -> f64 {
        (self.a.price - self.x.price).abs()
    }

    pub fn ab(&self) -> f64 {
        (self.b.price - self.a.price).abs()
    }

    pub fn bc(&self) -> f64 {
        (self.c.price - self.b.price).abs()
    }

    pub fn cd(&self) -> f64 {
        (self.d.price - self.c.price).abs()
    }

    pub fn ad(&self) -> f64 {
        (self.d.price - self.a.price).abs()
    }

    /// A is a swing high and D finished below it
    pub fn is_bullish(&self) -> bool {
        self.a.kind == PivotKind::High && self.d.price < self.a.price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct XabcdRatios {
    #[serde(rename = "XA_AB")]
    pub xa_ab: f64,
    #[serde(rename = "AB_BC")]
    pub ab_bc: f64,
    #[serde(rename = "BC_CD")]
    pub bc_cd: f64,
    #[serde(rename = "XA_AD")]
    pub xa_ad: f64,
}

impl XabcdRatios {
    pub fn from_points(points: &XabcdPoints) -> Result<Self> {
        let (xa, ab, bc) = (points.xa(), points.ab(), points.bc());
        if xa == 0.0 {
            return Err(SignalError::DegenerateGeometry("zero-length XA leg"));
        }
        if ab == 0.0 {
            return Err(SignalError::DegenerateGeometry("zero-length AB leg"));
        }
        if bc == 0.0 {
            return Err(SignalError::DegenerateGeometry("zero-length BC leg"));
        }
        Ok(Self {
            xa_ab: ab / xa,
            ab_bc: bc / ab,
            bc_cd: points.cd() / bc,
            xa_ad: points.ad() / xa,
        })
    }

    fn as_array(&self) -> [f64; 4] {
        [self.xa_ab, self.ab_bc, self.bc_cd, self.xa_ad]
    }

    /// Mean rule score when every rule of `kind` passes
    pub fn quality(&self, kind: HarmonicKind) -> Option<f64> {
        let scores = kind
            .rules()
            .iter()
            .zip(self.as_array())
            .map(|(rule, actual)| rule.score(actual))
            .collect::<Option<Vec<f64>>>()?;
        Some(mean(&scores))
    }
}

/// A validated harmonic pattern
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarmonicPattern {
    pub kind: HarmonicKind,
    pub points: XabcdPoints,
    pub ratios: XabcdRatios,
    pub quality: f64,
    pub is_bullish: bool,
    /// How close the last close sits to D, 1.0 = at D
    pub completion: f64,
    /// Price objectives beyond D
    pub targets: Vec<f64>,
}

// ============================================================
// DETECTOR
// ============================================================

#[derive(Debug, Clone)]
pub struct HarmonicDetector {
    pub min_bars: Period,
    pub pivot_order: Period,
    pub pivot_threshold_pct: f64,
    /// Weight of pattern quality against confluence in the final magnitude
    pub quality_weight: Ratio,
    /// Close within this fraction of D counts as "at completion"
    pub near_d: Ratio,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for HarmonicDetector {
    fn default() -> Self {
        Self {
            min_bars: Period::new_const(100),
            pivot_order: Period::new_const(5),
            pivot_threshold_pct: 3.0,
            quality_weight: Ratio::new_const(0.6),
            near_d: Ratio::new_const(0.02),
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

impl HarmonicDetector {
    pub fn extractor(&self) -> SwingExtractor {
        SwingExtractor::new(self.pivot_order, self.pivot_threshold_pct)
    }

    /// Match one 5-pivot window against every pattern, best quality first-seen
    pub fn match_window(&self, window: &[Pivot]) -> Result<Option<(HarmonicKind, f64)>> {
        if window.len() != 5 || !is_alternating(window) {
            return Ok(None);
        }
        let Some(points) = XabcdPoints::from_slice(window) else {
            return Ok(None);
        };
        let ratios = XabcdRatios::from_points(&points)?;

        let mut best: Option<(HarmonicKind, f64)> = None;
        for kind in HarmonicKind::ALL {
            if let Some(q) = ratios.quality(kind) {
                if best.map_or(true, |(_, b)| q > b) {
                    best = Some((kind, q));
                }
            }
        }
        Ok(best)
    }

    /// Best pattern across all windows. Degenerate windows are skipped and counted.
    pub fn find_best_pattern(
        &self,
        pivots: &[Pivot],
        last_close: f64,
    ) -> (Option<HarmonicPattern>, usize) {
        let mut best: Option<HarmonicPattern> = None;
        let mut degenerate = 0;

        for window in pivots.windows(5) {
            let matched = match self.match_window(window) {
                Ok(m) => m,
                Err(_) => {
                    degenerate += 1;
                    continue;
                }
            };
            let Some((kind, quality)) = matched else {
                continue;
            };
            if best.as_ref().is_some_and(|b| quality <= b.quality) {
                continue;
            }
            let Some(points) = XabcdPoints::from_slice(window) else {
                continue;
            };
            let Ok(ratios) = XabcdRatios::from_points(&points) else {
                continue;
            };
            let is_bullish = points.is_bullish();
            best = Some(HarmonicPattern {
                kind,
                points,
                ratios,
                quality,
                is_bullish,
                completion: completion(&points, last_close),
                targets: targets(&points, is_bullish),
            });
        }

        (best, degenerate)
    }

    /// Confluence in [0, 1]: baseline plus proximity, RSI and trend bonuses
    pub fn confluence(
        &self,
        pattern: &HarmonicPattern,
        last_close: f64,
        ctx: &ScoringContext,
    ) -> f64 {
        let mut confluence = CONFLUENCE_BASE;

        if relative_distance(last_close, pattern.points.d.price) < self.near_d.get() {
            confluence += NEAR_D_BONUS;
        }

        if let Some(rsi) = ctx.rsi {
            let oversold = pattern.is_bullish && rsi < self.rsi_oversold;
            let overbought = !pattern.is_bullish && rsi > self.rsi_overbought;
            if oversold || overbought {
                confluence += RSI_BONUS;
            }
        }

        match (ctx.trend, pattern.is_bullish) {
            (Some(Trend::Up), true) | (Some(Trend::Down), false) => confluence += TREND_BONUS,
            _ => {}
        }

        clip(confluence, 0.0, 1.0)
    }
}

/// clamp(1 - |close - D| / CD, 0, 1)
fn completion(points: &XabcdPoints, last_close: f64) -> f64 {
    let cd = points.cd();
    if cd == 0.0 {
        return 0.0;
    }
    clip(1.0 - (last_close - points.d.price).abs() / cd, 0.0, 1.0)
}

fn targets(points: &XabcdPoints, is_bullish: bool) -> Vec<f64> {
    let xa = points.xa();
    let sign = if is_bullish { 1.0 } else { -1.0 };
    TARGET_LEVELS
        .iter()
        .map(|level| points.d.price + sign * xa * level)
        .collect()
}

impl SignalDetector for HarmonicDetector {
    fn name(&self) -> &str {
        Self::detector_name()
    }

    fn min_bars(&self) -> usize {
        self.min_bars.get()
    }

    fn validate_config(&self) -> Result<()> {
        if !self.pivot_threshold_pct.is_finite() || self.pivot_threshold_pct < 0.0 {
            return Err(SignalError::InvalidConfig(
                "harmonic pivot_threshold_pct must be a non-negative number".into(),
            ));
        }
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(SignalError::InvalidConfig(
                "harmonic rsi_oversold must be below rsi_overbought".into(),
            ));
        }
        Ok(())
    }

    fn detect(&self, bars: &[Bar], ctx: &ScoringContext) -> Result<DetectionResult> {
        ensure_min_bars(bars.len(), self.min_bars.get())?;

        let pivots = self.extractor().extract(bars);
        if pivots.len() < 5 {
            let mut meta = Meta::new();
            meta.insert("pivots_found".into(), json!(pivots.len()));
            return Ok(DetectionResult::neutral(meta));
        }

        let last_close = bars[bars.len() - 1].close();
        let (best, degenerate) = self.find_best_pattern(&pivots, last_close);

        let Some(pattern) = best else {
            let mut meta = Meta::new();
            meta.insert("pivots_found".into(), json!(pivots.len()));
            meta.insert("patterns_scanned".into(), json!(pivots.len() - 4));
            if degenerate > 0 {
                meta.insert("degenerate_windows".into(), json!(degenerate));
            }
            return Ok(DetectionResult::neutral(meta));
        };

        let confluence = self.confluence(&pattern, last_close, ctx);
        let qw = self.quality_weight.get();
        let magnitude = qw * pattern.quality + (1.0 - qw) * confluence;
        let score = if pattern.is_bullish { magnitude } else { -magnitude };

        tracing::debug!(
            pattern = pattern.kind.as_str(),
            quality = pattern.quality,
            confluence,
            bullish = pattern.is_bullish,
            "harmonic pattern matched"
        );

        let mut meta = Meta::new();
        meta.insert("pattern".into(), json!(pattern.kind.as_str()));
        meta.insert("points".into(), json!(pattern.points));
        meta.insert("ratios".into(), json!(pattern.ratios));
        meta.insert("quality".into(), json!(pattern.quality));
        meta.insert("confluence".into(), json!(confluence));
        meta.insert("completion".into(), json!(pattern.completion));
        meta.insert("targets".into(), json!(pattern.targets));

        Ok(DetectionResult::new(
            clip(score, -1.0, 1.0),
            pattern.quality,
            meta,
        ))
    }
}

// ============================================================
// PARAMETERS
// ============================================================

static HARMONIC_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("min_bars", 100.0, (50.0, 300.0, 25.0), "Minimum bars before scanning"),
    ParamMeta::period("pivot_order", 5.0, (2.0, 10.0, 1.0), "Bars on each side of a pivot"),
    ParamMeta::level(
        "pivot_threshold_pct",
        3.0,
        (0.0, 10.0, 0.5),
        "Minimum percent move between pivots",
    ),
    ParamMeta::ratio(
        "quality_weight",
        0.6,
        (0.0, 1.0, 0.1),
        "Share of pattern quality in the final magnitude",
    ),
    ParamMeta::ratio("near_d", 0.02, (0.0, 0.1, 0.01), "Distance to D counted as completion"),
    ParamMeta::level("rsi_oversold", 30.0, (0.0, 50.0, 5.0), "RSI level confirming bullish"),
    ParamMeta::level("rsi_overbought", 70.0, (50.0, 100.0, 5.0), "RSI level confirming bearish"),
];

impl ParameterizedDetector for HarmonicDetector {
    fn param_meta() -> &'static [ParamMeta] {
        HARMONIC_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let p = ParamSet::new(params, HARMONIC_PARAMS)?;
        let detector = Self {
            min_bars: p.period("min_bars")?,
            pivot_order: p.period("pivot_order")?,
            pivot_threshold_pct: p.level("pivot_threshold_pct")?,
            quality_weight: p.ratio("quality_weight")?,
            near_d: p.ratio("near_d")?,
            rsi_oversold: p.level("rsi_oversold")?,
            rsi_overbought: p.level("rsi_overbought")?,
        };
        detector.validate_config()?;
        Ok(detector)
    }

    fn detector_name() -> &'static str {
        "harmonic"
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bar(c: f64) -> Bar {
        Bar::new(c, c, c, c, 1.0)
    }

    /// Linear legs between anchors with `step` bars per leg
    fn legs(anchors: &[f64], step: usize) -> Vec<Bar> {
        let mut out = Vec::new();
        for w in anchors.windows(2) {
            for s in 0..step {
                out.push(flat_bar(w[0] + (w[1] - w[0]) * s as f64 / step as f64));
            }
        }
        out.push(flat_bar(anchors[anchors.len() - 1]));
        out
    }

    fn bullish_gartley() -> Vec<Bar> {
        // X=100, A=120, B=107.64, C=115.28, D=104.28
        legs(&[110.0, 100.0, 120.0, 107.64, 115.28, 104.28, 106.0], 20)
    }

    fn bearish_gartley() -> Vec<Bar> {
        legs(&[110.0, 120.0, 100.0, 112.36, 104.72, 115.72, 114.0], 20)
    }

    fn pivot(index: usize, price: f64, kind: PivotKind) -> Pivot {
        Pivot::new(index, price, kind)
    }

    #[test]
    fn test_target_rule() {
        let rule = target(0.618, 0.03);
        assert_eq!(rule.score(0.618), Some(1.0));
        assert!(rule.score(0.63).unwrap() > 0.0);
        assert_eq!(rule.score(0.7), None);
    }

    #[test]
    fn test_range_rule() {
        let rule = range(0.382, 0.886);
        assert!((rule.score(0.634).unwrap() - 1.0).abs() < 1e-12);
        assert!((rule.score(0.382).unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(rule.score(0.9), None);
        assert_eq!(rule.score(f64::NAN), None);
    }

    #[test]
    fn test_degenerate_legs() {
        let window = [
            pivot(0, 100.0, PivotKind::Low),
            pivot(1, 100.0, PivotKind::High),
            pivot(2, 90.0, PivotKind::Low),
            pivot(3, 95.0, PivotKind::High),
            pivot(4, 92.0, PivotKind::Low),
        ];
        let points = XabcdPoints::from_slice(&window).unwrap();
        assert!(matches!(
            XabcdRatios::from_points(&points),
            Err(SignalError::DegenerateGeometry(_))
        ));
        let (best, degenerate) = HarmonicDetector::default().find_best_pattern(&window, 92.0);
        assert!(best.is_none());
        assert_eq!(degenerate, 1);
    }

    #[test]
    fn test_non_alternating_window_rejected() {
        let window = [
            pivot(0, 100.0, PivotKind::Low),
            pivot(1, 120.0, PivotKind::High),
            pivot(2, 125.0, PivotKind::High),
            pivot(3, 115.0, PivotKind::Low),
            pivot(4, 104.0, PivotKind::Low),
        ];
        assert_eq!(HarmonicDetector::default().match_window(&window), Ok(None));
    }

    #[test]
    fn test_bullish_gartley() {
        let bars = bullish_gartley();
        let detector = HarmonicDetector::default();
        let result = detector.detect(&bars, &ScoringContext::default()).unwrap();

        assert_eq!(result.meta["pattern"], "Gartley");
        assert!(result.score > 0.8, "score = {}", result.score);
        assert!(result.direction.is_bullish());
        assert!(result.confidence > 0.9);
        assert_eq!(result.meta["points"]["D"]["index"], 100);

        let completion = result.meta["completion"].as_f64().unwrap();
        assert!((completion - (1.0 - 1.72 / 11.0)).abs() < 1e-6);

        let targets = result.meta["targets"].as_array().unwrap();
        assert_eq!(targets.len(), 4);
        assert!((targets[2].as_f64().unwrap() - 124.28).abs() < 1e-6);
    }

    #[test]
    fn test_bearish_gartley_is_negative() {
        let bars = bearish_gartley();
        let result = HarmonicDetector::default()
            .detect(&bars, &ScoringContext::default())
            .unwrap();

        assert_eq!(result.meta["pattern"], "Gartley");
        assert!(result.score < -0.8);
        assert!(result.direction.is_bearish());
    }

    #[test]
    fn test_confluence_bonuses() {
        let bars = bullish_gartley();
        let detector = HarmonicDetector::default();
        let plain = detector.detect(&bars, &ScoringContext::default()).unwrap();
        let ctx = ScoringContext::default()
            .with_rsi(25.0)
            .with_trend(Trend::Up);
        let boosted = detector.detect(&bars, &ctx).unwrap();

        assert!((plain.meta["confluence"].as_f64().unwrap() - 0.7).abs() < 1e-9);
        assert!((boosted.meta["confluence"].as_f64().unwrap() - 0.95).abs() < 1e-9);
        assert!(boosted.score > plain.score);
    }

    #[test]
    fn test_ratios_recomputable_from_points() {
        let bars = bullish_gartley();
        let detector = HarmonicDetector::default();
        let pivots = detector.extractor().extract(&bars);
        let (best, _) = detector.find_best_pattern(&pivots, 106.0);
        let pattern = best.unwrap();

        let recomputed = XabcdRatios::from_points(&pattern.points).unwrap();
        assert_eq!(recomputed, pattern.ratios);
    }

    #[test]
    fn test_too_few_pivots() {
        let bars: Vec<Bar> = (0..120).map(|i| flat_bar(100.0 + i as f64 * 0.1)).collect();
        let result = HarmonicDetector::default()
            .detect(&bars, &ScoringContext::default())
            .unwrap();
        assert!(result.is_neutral());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.meta["pivots_found"], 0);
    }

    #[test]
    fn test_short_series_errors() {
        let bars = bullish_gartley();
        assert_eq!(
            HarmonicDetector::default().detect(&bars[..50], &ScoringContext::default()),
            Err(SignalError::InsufficientData { need: 100, got: 50 })
        );
    }

    #[test]
    fn test_with_params() {
        let mut params = HashMap::new();
        params.insert("pivot_threshold_pct", 4.5);
        let d = HarmonicDetector::with_params(&params).unwrap();
        assert_eq!(d.pivot_threshold_pct, 4.5);
        assert_eq!(d.min_bars.get(), 100);

        params.insert("rsi_oversold", 45.0);
        params.insert("rsi_overbought", 55.0);
        assert!(HarmonicDetector::with_params(&params).is_ok());

        params.insert("near_d", 0.5);
        assert!(HarmonicDetector::with_params(&params).is_err());
    }
}
