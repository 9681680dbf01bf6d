//! Elliott wave impulse detection
//!
//! Every run of 8 consecutive pivots is treated as context + 5 waves +
//! context. The inner 6 pivots bound waves 1-5, which must pass the three
//! hard rules (wave 2 retracement, wave 3 length, no wave 4 overlap) before
//! being graded on Fibonacci proportions.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::json;

use super::helpers::{clip, ensure_min_bars, FIB_1000, FIB_1618, FIB_2618, FIB_382, FIB_500, FIB_618, FIB_786};
use crate::{
    params::{ParamMeta, ParamSet, ParameterizedDetector},
    swing::{is_alternating, Pivot, SwingExtractor},
    Bar, DetectionResult, Meta, Period, Result, ScoringContext, SignalDetector, SignalError,
};

/// Pivots per candidate: one leading, six wave boundaries, one trailing
pub const WINDOW: usize = 8;

/// Projection multiples of wave 1 measured from its end
pub const FORECAST_LEVELS: [f64; 4] = [FIB_618, FIB_1000, FIB_1618, FIB_2618];

const FIB_146: f64 = 0.146;
const FIB_236: f64 = 0.236;

/// A single wave between two pivots
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Wave {
    pub label: u8,
    pub start_idx: usize,
    pub end_idx: usize,
    pub price_start: f64,
    pub price_end: f64,
    pub length: f64,
    pub length_pct: f64,
    pub is_up: bool,
}

impl Wave {
    fn between(label: u8, start: &Pivot, end: &Pivot) -> Option<Self> {
        if start.price <= 0.0 {
            return None;
        }
        let length = (end.price - start.price).abs();
        Some(Self {
            label,
            start_idx: start.index,
            end_idx: end.index,
            price_start: start.price,
            price_end: end.price,
            length,
            length_pct: length / start.price * 100.0,
            is_up: end.price > start.price,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FibTarget {
    pub level: f64,
    pub price: f64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub current_wave: u8,
    pub targets: Vec<FibTarget>,
    pub probabilities: BTreeMap<&'static str, f64>,
}

/// Validated five-wave impulse
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveCount {
    pub waves: [Wave; 5],
    pub confidence: f64,
    pub current_wave: u8,
    pub degree: &'static str,
    pub forecast: Forecast,
}

impl WaveCount {
    /// Impulse direction follows wave 1
    pub fn is_up(&self) -> bool {
        self.waves[0].is_up
    }
}

// ============================================================
// RULES AND GRADING
// ============================================================

/// The three hard rules of an impulse
pub fn satisfies_rules(waves: &[Wave; 5]) -> bool {
    let [w1, w2, w3, w4, w5] = waves;

    if w2.length > w1.length {
        return false;
    }
    if w3.length <= w1.length.max(w5.length) {
        return false;
    }
    if w1.is_up {
        w4.price_end >= w1.price_end
    } else {
        w4.price_end <= w1.price_end
    }
}

fn band_score(ratio: f64, ideal: (f64, f64), wide: (f64, f64), scores: (f64, f64, f64)) -> f64 {
    if (ideal.0..=ideal.1).contains(&ratio) {
        scores.0
    } else if (wide.0..=wide.1).contains(&ratio) {
        scores.1
    } else {
        scores.2
    }
}

#[inline]
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Weighted sum of the four proportion checks, clipped to [0, 1]
pub fn wave_confidence(waves: &[Wave; 5]) -> f64 {
    let [w1, w2, w3, w4, w5] = waves;

    let dominance = if w3.length > w1.length.max(w5.length) {
        0.3
    } else {
        0.1
    };
    let wave2 = band_score(
        ratio(w2.length, w1.length),
        (FIB_382, FIB_618),
        (FIB_236, FIB_786),
        (0.3, 0.2, 0.1),
    );
    let wave4 = band_score(
        ratio(w4.length, w3.length),
        (FIB_236, FIB_500),
        (FIB_146, FIB_618),
        (0.2, 0.15, 0.05),
    );
    let wave5 = band_score(
        ratio(w5.length, w1.length),
        (FIB_618, FIB_1000),
        (FIB_500, FIB_1618),
        (0.2, 0.15, 0.05),
    );

    clip(dominance + wave2 + wave4 + wave5, 0.0, 1.0)
}

/// Wave containing `index`, checked from wave 5 backwards
pub fn locate_wave(waves: &[Wave; 5], index: usize) -> u8 {
    waves
        .iter()
        .rev()
        .find(|w| index >= w.start_idx)
        .map_or(1, |w| w.label)
}

/// Score shift for the current position in the count
pub fn position_adjustment(current_wave: u8) -> f64 {
    match current_wave {
        3 => 0.4,
        5 => -0.2,
        2 => 0.2,
        4 => 0.1,
        _ => 0.0,
    }
}

pub fn forecast(waves: &[Wave; 5], current_wave: u8) -> Forecast {
    let w1 = &waves[0];
    let sign = if w1.is_up { 1.0 } else { -1.0 };
    let targets = FORECAST_LEVELS
        .iter()
        .map(|&level| FibTarget {
            level,
            price: w1.price_end + sign * w1.length * level,
            kind: "fibonacci",
        })
        .collect();

    let probabilities = match current_wave {
        3 => [("continuation", 0.8), ("reversal", 0.2)],
        5 => [("completion", 0.6), ("extension", 0.4)],
        _ => [("continuation", 0.6), ("reversal", 0.4)],
    };

    Forecast {
        current_wave,
        targets,
        probabilities: probabilities.into_iter().collect(),
    }
}

// ============================================================
// DETECTOR
// ============================================================

#[derive(Debug, Clone)]
pub struct ElliottDetector {
    pub min_bars: Period,
    pub pivot_order: Period,
    pub pivot_threshold_pct: f64,
}

impl Default for ElliottDetector {
    fn default() -> Self {
        Self {
            min_bars: Period::new_const(150),
            pivot_order: Period::new_const(5),
            pivot_threshold_pct: 4.0,
        }
    }
}

impl ElliottDetector {
    pub fn extractor(&self) -> SwingExtractor {
        SwingExtractor::new(self.pivot_order, self.pivot_threshold_pct)
    }

    /// Impulse count for one 8-pivot window, or None if the window fails
    pub fn identify_impulse(&self, window: &[Pivot]) -> Option<WaveCount> {
        if window.len() < WINDOW {
            return None;
        }
        let bounds = &window[1..7];
        if !is_alternating(bounds) {
            return None;
        }

        let waves = [
            Wave::between(1, &bounds[0], &bounds[1])?,
            Wave::between(2, &bounds[1], &bounds[2])?,
            Wave::between(3, &bounds[2], &bounds[3])?,
            Wave::between(4, &bounds[3], &bounds[4])?,
            Wave::between(5, &bounds[4], &bounds[5])?,
        ];
        if waves[0].length == 0.0 {
            return None;
        }
        if !satisfies_rules(&waves) {
            return None;
        }

        let confidence = wave_confidence(&waves);
        let current_wave = locate_wave(&waves, window[window.len() - 1].index);

        Some(WaveCount {
            forecast: forecast(&waves, current_wave),
            waves,
            confidence,
            current_wave,
            degree: "minor",
        })
    }

    /// Highest-confidence count across all windows, first seen wins ties
    pub fn best_count(&self, pivots: &[Pivot]) -> Option<WaveCount> {
        let mut best: Option<WaveCount> = None;
        for window in pivots.windows(WINDOW) {
            if let Some(count) = self.identify_impulse(window) {
                if best.as_ref().map_or(true, |b| count.confidence > b.confidence) {
                    best = Some(count);
                }
            }
        }
        best
    }

    /// Half the count confidence shifted by the current wave position.
    ///
    /// The impulse direction does not enter the score; it is reported in
    /// metadata only.
    pub fn score(&self, count: &WaveCount) -> f64 {
        clip(count.confidence * 0.5 + position_adjustment(count.current_wave), -1.0, 1.0)
    }
}

impl SignalDetector for ElliottDetector {
    fn name(&self) -> &str {
        Self::detector_name()
    }

    fn min_bars(&self) -> usize {
        self.min_bars.get()
    }

    fn validate_config(&self) -> Result<()> {
        if !self.pivot_threshold_pct.is_finite() || self.pivot_threshold_pct < 0.0 {
            return Err(SignalError::InvalidConfig(
                "elliott pivot_threshold_pct must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    fn detect(&self, bars: &[Bar], _ctx: &ScoringContext) -> Result<DetectionResult> {
        ensure_min_bars(bars.len(), self.min_bars.get())?;

        let pivots = self.extractor().extract(bars);
        if pivots.len() < WINDOW {
            let mut meta = Meta::new();
            meta.insert("pivots_found".into(), json!(pivots.len()));
            return Ok(DetectionResult::neutral(meta));
        }

        let Some(count) = self.best_count(&pivots) else {
            let mut meta = Meta::new();
            meta.insert("pivots_found".into(), json!(pivots.len()));
            meta.insert("windows_scanned".into(), json!(pivots.len() - WINDOW + 1));
            return Ok(DetectionResult::neutral(meta));
        };

        let score = self.score(&count);
        tracing::debug!(
            confidence = count.confidence,
            current_wave = count.current_wave,
            up = count.is_up(),
            score,
            "elliott impulse counted"
        );

        let mut meta = Meta::new();
        meta.insert("waves".into(), json!(count.waves));
        meta.insert("confidence".into(), json!(count.confidence));
        meta.insert("current_wave".into(), json!(count.current_wave.to_string()));
        meta.insert("degree".into(), json!(count.degree));
        meta.insert("impulse".into(), json!(if count.is_up() { "up" } else { "down" }));
        meta.insert("forecast".into(), json!(count.forecast));

        Ok(DetectionResult::new(score, count.confidence, meta))
    }
}

// ============================================================
// PARAMETERS
// ============================================================

static ELLIOTT_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("min_bars", 150.0, (50.0, 400.0, 25.0), "Minimum bars before counting"),
    ParamMeta::period("pivot_order", 5.0, (2.0, 10.0, 1.0), "Bars on each side of a pivot"),
    ParamMeta::level(
        "pivot_threshold_pct",
        4.0,
        (0.0, 12.0, 0.5),
        "Minimum percent move between pivots",
    ),
];

impl ParameterizedDetector for ElliottDetector {
    fn param_meta() -> &'static [ParamMeta] {
        ELLIOTT_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let p = ParamSet::new(params, ELLIOTT_PARAMS)?;
        let detector = Self {
            min_bars: p.period("min_bars")?,
            pivot_order: p.period("pivot_order")?,
            pivot_threshold_pct: p.level("pivot_threshold_pct")?,
        };
        detector.validate_config()?;
        Ok(detector)
    }

    fn detector_name() -> &'static str {
        "elliott"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swing::PivotKind;

    fn flat_bar(c: f64) -> Bar {
        Bar::new(c, c, c, c, 1.0)
    }

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

    // context 110, waves 100 -> 120 -> 110 -> 145 -> 135 -> 152, context 140
    const UP_IMPULSE: [f64; 10] = [105.0, 110.0, 100.0, 120.0, 110.0, 145.0, 135.0, 152.0, 140.0, 142.0];

    fn mirrored(anchors: &[f64]) -> Vec<f64> {
        anchors.iter().map(|p| 250.0 - p).collect()
    }

    fn wave(label: u8, start: f64, end: f64) -> Wave {
        let s = Pivot::new(label as usize * 10, start, PivotKind::Low);
        let e = Pivot::new(label as usize * 10 + 10, end, PivotKind::High);
        Wave::between(label, &s, &e).unwrap()
    }

    #[test]
    fn test_rules() {
        let good = [
            wave(1, 100.0, 120.0),
            wave(2, 120.0, 110.0),
            wave(3, 110.0, 145.0),
            wave(4, 145.0, 135.0),
            wave(5, 135.0, 152.0),
        ];
        assert!(satisfies_rules(&good));

        let mut deep_two = good;
        deep_two[1] = wave(2, 120.0, 95.0);
        assert!(!satisfies_rules(&deep_two));

        let mut short_three = good;
        short_three[2] = wave(3, 110.0, 125.0);
        assert!(!satisfies_rules(&short_three));

        let mut overlap = good;
        overlap[3] = wave(4, 145.0, 118.0);
        assert!(!satisfies_rules(&overlap));
    }

    #[test]
    fn test_confidence_bands() {
        let ideal = [
            wave(1, 100.0, 120.0),
            wave(2, 120.0, 110.0),
            wave(3, 110.0, 145.0),
            wave(4, 145.0, 135.0),
            wave(5, 135.0, 152.0),
        ];
        assert!((wave_confidence(&ideal) - 1.0).abs() < 1e-12);

        let mut shallow = ideal;
        shallow[1] = wave(2, 120.0, 118.0);
        // wave 2 retraces 10%: lowest band
        assert!((wave_confidence(&shallow) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_locate_wave_checks_wave_five_first() {
        let waves = [
            wave(1, 100.0, 120.0),
            wave(2, 120.0, 110.0),
            wave(3, 110.0, 145.0),
            wave(4, 145.0, 135.0),
            wave(5, 135.0, 152.0),
        ];
        assert_eq!(locate_wave(&waves, 100), 5);
        assert_eq!(locate_wave(&waves, 35), 3);
        assert_eq!(locate_wave(&waves, 0), 1);
    }

    #[test]
    fn test_forecast_probabilities() {
        let waves = [
            wave(1, 100.0, 120.0),
            wave(2, 120.0, 110.0),
            wave(3, 110.0, 145.0),
            wave(4, 145.0, 135.0),
            wave(5, 135.0, 152.0),
        ];
        let f = forecast(&waves, 3);
        assert_eq!(f.probabilities["continuation"], 0.8);
        assert!((f.targets[1].price - 140.0).abs() < 1e-12);

        let f = forecast(&waves, 5);
        assert_eq!(f.probabilities["completion"], 0.6);
        assert_eq!(f.probabilities["extension"], 0.4);
    }

    #[test]
    fn test_detects_up_impulse() {
        let bars = legs(&UP_IMPULSE, 20);
        let detector = ElliottDetector::default();
        let result = detector.detect(&bars, &ScoringContext::default()).unwrap();

        assert!((result.confidence - 1.0).abs() < 1e-12);
        assert_eq!(result.meta["current_wave"], "5");
        assert_eq!(result.meta["impulse"], "up");
        assert!((result.score - 0.3).abs() < 1e-12);
        assert!(result.direction.is_bullish());
        assert_eq!(result.meta["waves"].as_array().unwrap().len(), 5);
        assert_eq!(result.meta["forecast"]["targets"][0]["type"], "fibonacci");
    }

    #[test]
    fn test_detects_down_impulse() {
        let bars = legs(&mirrored(&UP_IMPULSE), 20);
        let result = ElliottDetector::default()
            .detect(&bars, &ScoringContext::default())
            .unwrap();

        assert_eq!(result.meta["impulse"], "down");
        assert!((result.confidence - 1.0).abs() < 1e-12);
        assert_eq!(result.meta["current_wave"], "5");
        // same position as the up count, so the same bullish score
        assert!((result.score - 0.3).abs() < 1e-12);
        assert!(result.direction.is_bullish());
    }

    #[test]
    fn test_rule_violation_is_neutral() {
        let mut anchors = UP_IMPULSE;
        // wave 3 (110 -> 125) shorter than wave 5 (118 -> 152)
        anchors[5] = 125.0;
        anchors[6] = 118.0;
        let bars = legs(&anchors, 20);
        let result = ElliottDetector::default()
            .detect(&bars, &ScoringContext::default())
            .unwrap();

        assert!(result.is_neutral());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.meta["windows_scanned"], 1);
    }

    #[test]
    fn test_short_series() {
        let bars = legs(&UP_IMPULSE, 10);
        let result = ElliottDetector::default().evaluate(&bars, &ScoringContext::default());
        assert!(result.is_neutral());
        assert_eq!(result.meta["insufficient_data"], true);
    }
}
