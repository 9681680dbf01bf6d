//! Smart money concepts
//!
//! Four independent sub-detections feed one score:
//! - Break of structure (BOS): close through the recent extreme
//! - Change of character (CHOCH): failure to extend the prior extreme
//! - Order blocks: last opposite candle before a strong breakout candle
//! - Fair value gaps: three-bar imbalances left open

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use super::helpers::{clip, ensure_min_bars, max_high, min_low};
use crate::{
    params::{ParamMeta, ParamSet, ParameterizedDetector},
    Bar, DetectionResult, Meta, OHLCVExt, Period, Ratio, Result, ScoringContext, SignalDetector,
    SignalError, OHLCV,
};

const BOS_WEIGHT: f64 = 0.7;
const CHOCH_WEIGHT: f64 = 0.5;

const STRUCTURE_SHARE: f64 = 0.5;
const ORDER_BLOCK_SHARE: f64 = 0.3;
const FVG_SHARE: f64 = 0.2;

const OB_NEAR_SCORE: f64 = 0.7;
const OB_FAR_SCORE: f64 = 0.4;
const FVG_SCORE: f64 = 0.5;

const BASE_CONFIDENCE: f64 = 0.5;
const SIGNAL_CONFIDENCE: f64 = 0.2;

// ============================================================
// STRUCTURES
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StructureKind {
    #[serde(rename = "BOS")]
    Bos,
    #[serde(rename = "CHOCH")]
    Choch,
}

/// A BOS or CHOCH event on the latest bars
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StructureBreak {
    pub is_bullish: bool,
    #[serde(rename = "type")]
    pub kind: StructureKind,
    /// Reference level broken (BOS) or held (CHOCH)
    pub level: f64,
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderBlock {
    pub index: usize,
    pub high: f64,
    pub low: f64,
    pub is_bullish: bool,
    pub strength: f64,
}

impl OrderBlock {
    /// Distance from `price` to the nearer band edge
    pub fn distance(&self, price: f64) -> f64 {
        (price - self.high).abs().min((price - self.low).abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FairValueGap {
    pub index: usize,
    pub gap_high: f64,
    pub gap_low: f64,
    pub is_bullish: bool,
}

impl FairValueGap {
    pub fn contains(&self, price: f64) -> bool {
        self.gap_low <= price && price <= self.gap_high
    }
}

// ============================================================
// DETECTOR
// ============================================================

#[derive(Debug, Clone)]
pub struct SmcDetector {
    pub min_bars: Period,
    pub bos_lookback: Period,
    /// Most recent bars left out of the BOS reference window
    pub bos_exclude: usize,
    pub choch_recent: Period,
    pub choch_prior: Period,
    pub ob_lookback: Period,
    pub ob_min_move: Ratio,
    pub ob_keep: Period,
    pub fvg_min_gap: Ratio,
    pub fvg_keep: Period,
    pub ob_near: Ratio,
    pub ob_far: Ratio,
}

impl Default for SmcDetector {
    fn default() -> Self {
        Self {
            min_bars: Period::new_const(50),
            bos_lookback: Period::new_const(20),
            bos_exclude: 3,
            choch_recent: Period::new_const(5),
            choch_prior: Period::new_const(10),
            ob_lookback: Period::new_const(50),
            ob_min_move: Ratio::new_const(0.02),
            ob_keep: Period::new_const(5),
            fvg_min_gap: Ratio::new_const(0.005),
            fvg_keep: Period::new_const(10),
            ob_near: Ratio::new_const(0.01),
            ob_far: Ratio::new_const(0.03),
        }
    }
}

impl SmcDetector {
    pub fn detect_bos(&self, bars: &[Bar]) -> Option<StructureBreak> {
        let n = bars.len();
        if n < 2 {
            return None;
        }
        let lookback = self.bos_lookback.get().min(n - 1);
        let window = &bars[n - lookback..];
        let reference = &window[..window.len().saturating_sub(self.bos_exclude)];
        if reference.is_empty() {
            return None;
        }

        let ref_high = max_high(reference);
        let ref_low = min_low(reference);
        let current = bars[n - 1].close();
        let prev = bars[n - 2].close();

        if current > ref_high && prev <= ref_high {
            return Some(StructureBreak {
                is_bullish: true,
                kind: StructureKind::Bos,
                level: ref_high,
                strength: (current - ref_high) / ref_high,
            });
        }
        if current < ref_low && prev >= ref_low {
            return Some(StructureBreak {
                is_bullish: false,
                kind: StructureKind::Bos,
                level: ref_low,
                strength: (ref_low - current) / ref_low,
            });
        }
        None
    }

    pub fn detect_choch(&self, bars: &[Bar]) -> Option<StructureBreak> {
        let recent = self.choch_recent.get();
        let span = recent + self.choch_prior.get();
        if bars.len() < span {
            return None;
        }
        let window = &bars[bars.len() - span..];
        let (prior_bars, recent_bars) = window.split_at(window.len() - recent);

        let prev_low = min_low(prior_bars);
        let recent_low = min_low(recent_bars);
        if recent_low > prev_low {
            return Some(StructureBreak {
                is_bullish: true,
                kind: StructureKind::Choch,
                level: prev_low,
                strength: (recent_low - prev_low) / prev_low,
            });
        }

        let prev_high = max_high(prior_bars);
        let recent_high = max_high(recent_bars);
        if recent_high < prev_high {
            return Some(StructureBreak {
                is_bullish: false,
                kind: StructureKind::Choch,
                level: prev_high,
                strength: (prev_high - recent_high) / prev_high,
            });
        }
        None
    }

    /// Strongest order blocks within the most recent `ob_lookback` bars
    pub fn detect_order_blocks(&self, bars: &[Bar]) -> Vec<OrderBlock> {
        let n = bars.len();
        let lookback = self.ob_lookback.get().min(n);
        if lookback < 4 {
            return Vec::new();
        }
        let offset = n - lookback;
        let min_move = self.ob_min_move.get();
        let mut blocks = Vec::new();

        for i in (offset..=offset + lookback - 3).rev() {
            let curr = &bars[i];
            let next = &bars[i + 1];
            let Some(move_size) = next.body_move() else {
                continue;
            };

            let bullish = curr.is_bearish() && next.is_bullish() && next.close > curr.high;
            let bearish = curr.is_bullish() && next.is_bearish() && next.close < curr.low;

            if (bullish || bearish) && move_size > min_move {
                blocks.push(OrderBlock {
                    index: i,
                    high: curr.high,
                    low: curr.low,
                    is_bullish: bullish,
                    strength: move_size,
                });
            }
        }

        blocks.sort_by(|a, b| b.strength.total_cmp(&a.strength));
        blocks.truncate(self.ob_keep.get());
        blocks
    }

    /// Most recent `fvg_keep` gaps, oldest first
    pub fn detect_fvgs(&self, bars: &[Bar]) -> Vec<FairValueGap> {
        let min_gap = self.fvg_min_gap.get();
        let mut gaps: Vec<FairValueGap> = bars
            .windows(3)
            .enumerate()
            .filter_map(|(i, w)| {
                let (c1, c3) = (&w[0], &w[2]);
                if c3.low > c1.high && (c3.low - c1.high) / c1.high > min_gap {
                    Some(FairValueGap {
                        index: i,
                        gap_high: c3.low,
                        gap_low: c1.high,
                        is_bullish: true,
                    })
                } else if c3.high < c1.low && (c1.low - c3.high) / c3.high > min_gap {
                    Some(FairValueGap {
                        index: i,
                        gap_high: c1.low,
                        gap_low: c3.high,
                        is_bullish: false,
                    })
                } else {
                    None
                }
            })
            .collect();

        let keep = self.fvg_keep.get();
        if gaps.len() > keep {
            gaps.drain(..gaps.len() - keep);
        }
        gaps
    }

    pub fn nearest_order_block<'a>(
        &self,
        blocks: &'a [OrderBlock],
        price: f64,
    ) -> Option<&'a OrderBlock> {
        blocks
            .iter()
            .min_by(|a, b| a.distance(price).total_cmp(&b.distance(price)))
    }

    /// Signed proximity score of the nearest order block
    pub fn order_block_score(&self, blocks: &[OrderBlock], price: f64) -> f64 {
        let Some(nearest) = self.nearest_order_block(blocks, price) else {
            return 0.0;
        };
        let distance = nearest.distance(price) / price;
        let magnitude = if distance < self.ob_near.get() {
            OB_NEAR_SCORE
        } else if distance < self.ob_far.get() {
            OB_FAR_SCORE
        } else {
            0.0
        };
        if nearest.is_bullish {
            magnitude
        } else {
            -magnitude
        }
    }

    /// ±0.5 when price sits inside a gap, most recent gap first
    pub fn fvg_score(&self, gaps: &[FairValueGap], price: f64) -> f64 {
        match gaps.iter().rev().find(|g| g.contains(price)) {
            Some(g) if g.is_bullish => FVG_SCORE,
            Some(_) => -FVG_SCORE,
            None => 0.0,
        }
    }
}

fn structure_contribution(signal: Option<&StructureBreak>, weight: f64) -> f64 {
    match signal {
        Some(s) if s.is_bullish => weight,
        Some(_) => -weight,
        None => 0.0,
    }
}

impl SignalDetector for SmcDetector {
    fn name(&self) -> &str {
        Self::detector_name()
    }

    fn min_bars(&self) -> usize {
        self.min_bars.get()
    }

    fn validate_config(&self) -> Result<()> {
        if self.ob_near.get() > self.ob_far.get() {
            return Err(SignalError::InvalidConfig(
                "smc ob_near must not exceed ob_far".into(),
            ));
        }
        if self.bos_exclude >= self.bos_lookback.get() {
            return Err(SignalError::InvalidConfig(
                "smc bos_exclude must be smaller than bos_lookback".into(),
            ));
        }
        Ok(())
    }

    fn detect(&self, bars: &[Bar], _ctx: &ScoringContext) -> Result<DetectionResult> {
        ensure_min_bars(bars.len(), self.min_bars.get())?;

        let bos = self.detect_bos(bars);
        let choch = self.detect_choch(bars);
        let blocks = self.detect_order_blocks(bars);
        let gaps = self.detect_fvgs(bars);

        let price = bars[bars.len() - 1].close();
        let structure = structure_contribution(bos.as_ref(), BOS_WEIGHT)
            + structure_contribution(choch.as_ref(), CHOCH_WEIGHT);
        let ob_score = self.order_block_score(&blocks, price);
        let fvg_score = self.fvg_score(&gaps, price);

        let score = STRUCTURE_SHARE * structure + ORDER_BLOCK_SHARE * ob_score + FVG_SHARE * fvg_score;
        let signals = bos.is_some() as usize + choch.is_some() as usize;
        let confidence = BASE_CONFIDENCE + SIGNAL_CONFIDENCE * signals as f64;

        tracing::debug!(
            bos = bos.is_some(),
            choch = choch.is_some(),
            order_blocks = blocks.len(),
            fvgs = gaps.len(),
            score,
            "smc structures scanned"
        );

        let nearest = self.nearest_order_block(&blocks, price).map(|ob| {
            json!({
                "high": ob.high,
                "low": ob.low,
                "is_bullish": ob.is_bullish,
                "distance_pct": ob.distance(price) / price * 100.0,
            })
        });

        let mut meta = Meta::new();
        meta.insert("bos".into(), json!(bos.is_some()));
        meta.insert("choch".into(), json!(choch.is_some()));
        meta.insert("bos_details".into(), json!(bos));
        meta.insert("choch_details".into(), json!(choch));
        meta.insert("order_blocks_count".into(), json!(blocks.len()));
        meta.insert("fvg_count".into(), json!(gaps.len()));
        meta.insert("nearest_ob".into(), nearest.unwrap_or(Value::Null));
        meta.insert("order_blocks".into(), json!(blocks));
        meta.insert("fair_value_gaps".into(), json!(gaps));

        Ok(DetectionResult::new(clip(score, -1.0, 1.0), confidence, meta))
    }
}

// ============================================================
// PARAMETERS
// ============================================================

static SMC_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("min_bars", 50.0, (30.0, 200.0, 10.0), "Minimum bars before scanning"),
    ParamMeta::period("bos_lookback", 20.0, (10.0, 50.0, 5.0), "Bars in the BOS window"),
    ParamMeta::period("bos_exclude", 3.0, (1.0, 5.0, 1.0), "Recent bars left out of the BOS reference"),
    ParamMeta::period("choch_recent", 5.0, (3.0, 10.0, 1.0), "Recent bars compared for CHOCH"),
    ParamMeta::period("choch_prior", 10.0, (5.0, 20.0, 1.0), "Prior bars compared for CHOCH"),
    ParamMeta::period("ob_lookback", 50.0, (10.0, 100.0, 10.0), "Bars scanned for order blocks"),
    ParamMeta::ratio("ob_min_move", 0.02, (0.005, 0.05, 0.005), "Breakout body move for an order block"),
    ParamMeta::period("ob_keep", 5.0, (1.0, 10.0, 1.0), "Order blocks retained"),
    ParamMeta::ratio("fvg_min_gap", 0.005, (0.001, 0.02, 0.001), "Minimum relative gap size"),
    ParamMeta::period("fvg_keep", 10.0, (1.0, 20.0, 1.0), "Fair value gaps retained"),
    ParamMeta::ratio("ob_near", 0.01, (0.0, 0.05, 0.005), "Distance for strong order block proximity"),
    ParamMeta::ratio("ob_far", 0.03, (0.0, 0.1, 0.01), "Distance for weak order block proximity"),
];

impl ParameterizedDetector for SmcDetector {
    fn param_meta() -> &'static [ParamMeta] {
        SMC_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let p = ParamSet::new(params, SMC_PARAMS)?;
        let detector = Self {
            min_bars: p.period("min_bars")?,
            bos_lookback: p.period("bos_lookback")?,
            bos_exclude: p.period("bos_exclude")?.get(),
            choch_recent: p.period("choch_recent")?,
            choch_prior: p.period("choch_prior")?,
            ob_lookback: p.period("ob_lookback")?,
            ob_min_move: p.ratio("ob_min_move")?,
            ob_keep: p.period("ob_keep")?,
            fvg_min_gap: p.ratio("fvg_min_gap")?,
            fvg_keep: p.period("fvg_keep")?,
            ob_near: p.ratio("ob_near")?,
            ob_far: p.ratio("ob_far")?,
        };
        detector.validate_config()?;
        Ok(detector)
    }

    fn detector_name() -> &'static str {
        "smc"
    }
}

// ============================================================
// TESTS
// ============================================================
