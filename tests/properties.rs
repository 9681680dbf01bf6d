//! Property tests: invariants that must hold for any input.

use confluence::detectors::{XabcdPoints, XabcdRatios};
use confluence::prelude::*;
use confluence::scoring::{aggregate, disagreement, ComponentScore};
use confluence::swing::{is_alternating, pct_move};
use proptest::prelude::*;

/// Random walk with valid OHLC geometry from per-bar percentage changes
fn walk(changes: &[f64]) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(changes.len());
    let mut prev = 100.0;
    for (i, pct) in changes.iter().enumerate() {
        let close = (prev * (1.0 + pct / 100.0)).max(1.0);
        let (lo, hi) = if close > prev { (prev, close) } else { (close, prev) };
        bars.push(Bar::new(prev, hi * 1.004, lo * 0.996, close, 1_000.0).with_timestamp(i as i64));
        prev = close;
    }
    bars
}

fn changes(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(-4.0f64..4.0, len)
}

fn component_strategy() -> impl Strategy<Value = (f64, f64, f64)> {
    (0.01f64..1.0, -1.0f64..=1.0, 0.0f64..=1.0)
}

proptest! {
    #[test]
    fn pivots_alternate_and_respect_threshold(
        changes in changes(0..300),
        threshold in 0.0f64..10.0,
    ) {
        let bars = walk(&changes);
        let pivots = extract_pivots(&bars, threshold);

        prop_assert!(is_alternating(&pivots));
        for w in pivots.windows(2) {
            prop_assert!(w[0].index < w[1].index);
            prop_assert!(pct_move(w[0].price, w[1].price) >= threshold);
        }
    }

    #[test]
    fn detection_direction_agrees_with_sign(score in any::<f64>(), confidence in any::<f64>()) {
        let r = DetectionResult::new(score, confidence, Meta::new());
        prop_assert!((-1.0..=1.0).contains(&r.score));
        prop_assert!((0.0..=1.0).contains(&r.confidence));
        prop_assert_eq!(r.direction, Direction::from_score(r.score));
    }

    #[test]
    fn aggregate_stays_in_bounds(parts in proptest::collection::vec(component_strategy(), 1..6)) {
        let total: f64 = parts.iter().map(|p| p.0).sum();
        let components: Vec<ComponentScore> = parts
            .iter()
            .enumerate()
            .map(|(i, &(w, s, c))| {
                ComponentScore::new(format!("d{i}"), w / total, DetectionResult::new(s, c, Meta::new()))
            })
            .collect();

        let combined = aggregate(components, &AdviceThresholds::default());
        prop_assert!((-1.0..=1.0).contains(&combined.final_score));
        prop_assert!((0.0..=1.0).contains(&combined.confidence));
        prop_assert!((0.0..=1.0).contains(&combined.disagreement));
        prop_assert!(combined.bull_mass + combined.bear_mass <= 1.0 + 1e-9);
        if combined.components.iter().all(|c| c.direction == Direction::Neutral) {
            prop_assert_eq!((combined.bull_mass, combined.bear_mass), (0.0, 0.0));
        }
    }

    #[test]
    fn unanimous_confident_components_never_disagree(
        scores in proptest::collection::vec(0.01f64..=1.0, 2..6),
    ) {
        let components: Vec<ComponentScore> = scores
            .iter()
            .map(|&s| ComponentScore::new("d", 0.1, DetectionResult::new(s, 1.0, Meta::new())))
            .collect();
        prop_assert_eq!(disagreement(&components), 0.0);
    }

    #[test]
    fn harmonic_quality_in_unit_range(
        x in 50.0f64..150.0,
        legs in proptest::collection::vec(1.0f64..40.0, 4),
        bullish in any::<bool>(),
    ) {
        let sign = if bullish { 1.0 } else { -1.0 };
        let a = x + sign * legs[0];
        let b = a - sign * legs[1];
        let c = b + sign * legs[2];
        let d = c - sign * legs[3];
        prop_assume!(b > 0.0 && d > 0.0);

        let (up, down) = if bullish {
            (PivotKind::High, PivotKind::Low)
        } else {
            (PivotKind::Low, PivotKind::High)
        };
        let points = XabcdPoints {
            x: Pivot::new(0, x, down),
            a: Pivot::new(10, a, up),
            b: Pivot::new(20, b, down),
            c: Pivot::new(30, c, up),
            d: Pivot::new(40, d, down),
        };

        let ratios = XabcdRatios::from_points(&points).unwrap();
        prop_assert!((ratios.xa_ab * points.xa() - points.ab()).abs() < 1e-9);
        prop_assert!((ratios.bc_cd * points.bc() - points.cd()).abs() < 1e-9);

        for kind in HarmonicKind::ALL {
            if let Some(q) = ratios.quality(kind) {
                prop_assert!((0.0..=1.0).contains(&q), "{} quality {}", kind.as_str(), q);
            }
        }
    }

    #[test]
    fn elliott_counts_obey_impulse_rules(changes in changes(150..400)) {
        let bars = walk(&changes);
        let detector = ElliottDetector::default();
        let pivots = detector.extractor().extract(&bars);

        if let Some(count) = detector.best_count(&pivots) {
            let [w1, w2, w3, _, w5] = &count.waves;
            prop_assert!(w2.length <= w1.length);
            prop_assert!(w3.length > w1.length);
            prop_assert!(w3.length > w5.length);
            prop_assert!((0.0..=1.0).contains(&count.confidence));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn engine_output_is_bounded(changes in changes(0..260)) {
        let engine = EngineBuilder::new().with_all_defaults().build().unwrap();
        let bars = walk(&changes);
        let combined = engine.score_blocking(&bars, &ScoringContext::default());

        prop_assert_eq!(combined.components.len(), 3);
        prop_assert!((-1.0..=1.0).contains(&combined.final_score));
        for c in &combined.components {
            prop_assert!((-1.0..=1.0).contains(&c.score));
            prop_assert!((0.0..=1.0).contains(&c.confidence));
            prop_assert_eq!(c.direction, Direction::from_score(c.score));
        }
        prop_assert_eq!(engine.score_blocking(&bars, &ScoringContext::default()), combined);
    }
}
