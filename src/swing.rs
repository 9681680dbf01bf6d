//! Swing-point (pivot) extraction.
//!
//! A bar is a swing HIGH when its high is strictly above the highs of the
//! `order` bars on each side; LOW mirrors that on lows. Raw extrema are then
//! zigzag-filtered so the returned sequence strictly alternates and every
//! consecutive pair moves by at least `threshold_pct` percent.

use serde::{Deserialize, Serialize};

use crate::{OHLCVExt, Period, OHLCV};

/// Default neighborhood on each side of a pivot
pub const DEFAULT_ORDER: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PivotKind {
    High,
    Low,
}

impl PivotKind {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            PivotKind::High => PivotKind::Low,
            PivotKind::Low => PivotKind::High,
        }
    }
}

/// Local extremum of the price series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub index: usize,
    pub price: f64,
    #[serde(rename = "type")]
    pub kind: PivotKind,
}

impl Pivot {
    pub fn new(index: usize, price: f64, kind: PivotKind) -> Self {
        Self { index, price, kind }
    }

    #[inline]
    pub fn is_high(&self) -> bool {
        self.kind == PivotKind::High
    }

    #[inline]
    pub fn is_low(&self) -> bool {
        self.kind == PivotKind::Low
    }

    /// Higher high or lower low than `other` (same kind assumed)
    #[inline]
    fn is_more_extreme_than(&self, other: &Pivot) -> bool {
        match self.kind {
            PivotKind::High => self.price > other.price,
            PivotKind::Low => self.price < other.price,
        }
    }
}

/// Percent move from `from` to `to`, always non-negative
#[inline]
pub fn pct_move(from: f64, to: f64) -> f64 {
    ((to - from) / from).abs() * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingExtractor {
    pub order: Period,
    /// Minimum move between kept pivots, in percent (3.0 = 3%)
    pub threshold_pct: f64,
}

impl Default for SwingExtractor {
    fn default() -> Self {
        Self {
            order: Period::new_const(DEFAULT_ORDER),
            threshold_pct: 5.0,
        }
    }
}

impl SwingExtractor {
    pub fn new(order: Period, threshold_pct: f64) -> Self {
        Self {
            order,
            threshold_pct,
        }
    }

    pub fn with_threshold(threshold_pct: f64) -> Self {
        Self {
            threshold_pct,
            ..Self::default()
        }
    }

    /// Alternating, threshold-filtered pivots ordered by index.
    ///
    /// Empty for short or invalid input.
    pub fn extract<T: OHLCV>(&self, bars: &[T]) -> Vec<Pivot> {
        let k = self.order.get();
        if bars.len() < 2 * k + 1 {
            return Vec::new();
        }
        if !self.threshold_pct.is_finite() || self.threshold_pct < 0.0 {
            return Vec::new();
        }
        if bars.iter().any(|b| b.validate().is_err()) {
            return Vec::new();
        }

        let candidates = raw_extrema(bars, k);
        zigzag(candidates, self.threshold_pct)
    }
}

/// Strict local extrema in `k..len-k`, HIGH before LOW on the same bar
fn raw_extrema<T: OHLCV>(bars: &[T], k: usize) -> Vec<Pivot> {
    let mut out = Vec::new();

    for i in k..bars.len() - k {
        let high = bars[i].high();
        let low = bars[i].low();

        let is_high = (1..=k).all(|j| high > bars[i - j].high() && high > bars[i + j].high());
        let is_low = (1..=k).all(|j| low < bars[i - j].low() && low < bars[i + j].low());

        if is_high {
            out.push(Pivot::new(i, high, PivotKind::High));
        }
        if is_low {
            out.push(Pivot::new(i, low, PivotKind::Low));
        }
    }

    out
}

fn zigzag(candidates: Vec<Pivot>, threshold_pct: f64) -> Vec<Pivot> {
    let mut kept: Vec<Pivot> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let Some(last) = kept.last_mut() else {
            kept.push(candidate);
            continue;
        };

        if candidate.kind == last.kind {
            // Same side twice in a row: keep whichever is more extreme.
            if candidate.is_more_extreme_than(last) {
                *last = candidate;
            }
            continue;
        }

        if candidate.index > last.index && pct_move(last.price, candidate.price) >= threshold_pct {
            kept.push(candidate);
        }
    }

    kept
}

/// Convenience wrapper with the default neighborhood
pub fn extract_pivots<T: OHLCV>(bars: &[T], threshold_pct: f64) -> Vec<Pivot> {
    SwingExtractor::with_threshold(threshold_pct).extract(bars)
}

/// True when consecutive pivots never share a kind
pub fn is_alternating(pivots: &[Pivot]) -> bool {
    pivots.windows(2).all(|w| w[0].kind != w[1].kind)
}
