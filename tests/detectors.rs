//! Integration tests for the builtin detectors through the public API.

use std::collections::HashMap;

use confluence::prelude::*;

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

fn gartley() -> Vec<Bar> {
    legs(&[110.0, 100.0, 120.0, 107.64, 115.28, 104.28, 106.0], 20)
}

fn impulse() -> Vec<Bar> {
    legs(
        &[105.0, 110.0, 100.0, 120.0, 110.0, 145.0, 135.0, 152.0, 140.0, 142.0],
        20,
    )
}

fn defaults_of<D: ParameterizedDetector>() -> HashMap<&'static str, f64> {
    confluence::params::defaults(D::param_meta())
}

// ============================================================
// PARAMETERS
// ============================================================

#[test]
fn test_param_defaults_are_valid() {
    let metas = [
        HarmonicDetector::param_meta(),
        ElliottDetector::param_meta(),
        SmcDetector::param_meta(),
    ];
    for meta in metas {
        for m in meta {
            assert!(m.validate(m.default).is_ok(), "{} default invalid", m.name);
            let grid = m.generate_grid();
            assert!(!grid.is_empty(), "{} has an empty grid", m.name);
            assert_eq!(grid[0], m.range.0);
        }
    }
}

#[test]
fn test_with_params_defaults_match_default() {
    let h = HarmonicDetector::with_params(&defaults_of::<HarmonicDetector>()).unwrap();
    assert_eq!(format!("{h:?}"), format!("{:?}", HarmonicDetector::default()));

    let e = ElliottDetector::with_params(&defaults_of::<ElliottDetector>()).unwrap();
    assert_eq!(format!("{e:?}"), format!("{:?}", ElliottDetector::default()));

    let s = SmcDetector::with_params(&defaults_of::<SmcDetector>()).unwrap();
    assert_eq!(format!("{s:?}"), format!("{:?}", SmcDetector::default()));
}

#[test]
fn test_from_params_by_name() {
    for name in BuiltinDetector::names() {
        let d = BuiltinDetector::from_params(name, &HashMap::new()).unwrap();
        assert_eq!(d.name(), name);
        assert!(d.validate_config().is_ok());
    }

    let mut params = HashMap::new();
    params.insert("min_bars", 150.0);
    let smc = BuiltinDetector::from_params("smc", &params).unwrap();
    assert_eq!(smc.min_bars(), 150);

    params.insert("no_such_param", 1.0);
    assert!(BuiltinDetector::from_params("smc", &params).is_err());
    assert!(matches!(
        BuiltinDetector::from_params("wyckoff", &HashMap::new()),
        Err(SignalError::UnknownDetector(_))
    ));
}

// ============================================================
// DETECTION
// ============================================================

#[test]
fn test_short_series_neutral_for_every_builtin() {
    let bars = legs(&[100.0, 110.0, 95.0], 10);
    for d in BuiltinDetector::all_defaults() {
        let r = d.evaluate(&bars, &ScoringContext::default());
        assert_eq!(r.direction, Direction::Neutral, "{}", d.name());
        assert_eq!(r.score, 0.0);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.meta["bars_required"], d.min_bars());
    }
}

#[test]
fn test_harmonic_gartley_through_builtin() {
    let d = BuiltinDetector::Harmonic(HarmonicDetector::default());
    let r = d.evaluate(&gartley(), &ScoringContext::default());

    assert_eq!(r.direction, Direction::Bullish);
    assert_eq!(r.meta["pattern"], "Gartley");
    assert!(r.score > 0.8);
    assert!(r.confidence > 0.9);

    let points = &r.meta["points"];
    assert_eq!(points["X"]["type"], "LOW");
    assert_eq!(points["D"]["price"], 104.28);
    assert_eq!(r.meta["targets"].as_array().unwrap().len(), 4);
}

#[test]
fn test_harmonic_rsi_confluence_raises_score() {
    let d = HarmonicDetector::default();
    let plain = d.evaluate(&gartley(), &ScoringContext::default());
    let confirmed = d.evaluate(
        &gartley(),
        &ScoringContext::new().with_rsi(25.0).with_trend(Trend::Up),
    );
    assert!(confirmed.score > plain.score);
    assert_eq!(confirmed.confidence, plain.confidence);
}

#[test]
fn test_elliott_impulse_through_builtin() {
    let d = BuiltinDetector::Elliott(ElliottDetector::default());
    let r = d.evaluate(&impulse(), &ScoringContext::default());

    assert_eq!(r.direction, Direction::Bullish);
    assert_eq!(r.meta["impulse"], "up");
    assert_eq!(r.meta["degree"], "minor");
    assert_eq!(r.meta["waves"].as_array().unwrap().len(), 5);
    assert_eq!(r.meta["forecast"]["targets"].as_array().unwrap().len(), 4);
}

#[test]
fn test_smc_flat_market() {
    let bars: Vec<Bar> = (0..80).map(|_| Bar::new(100.0, 100.5, 99.5, 100.0, 1.0)).collect();
    let r = SmcDetector::default().evaluate(&bars, &ScoringContext::default());

    assert_eq!(r.score, 0.0);
    assert_eq!(r.meta["bos"], false);
    assert_eq!(r.meta["choch"], false);
    assert_eq!(r.meta["order_blocks_count"], 0);
    assert!(r.meta["nearest_ob"].is_null());
}

#[test]
fn test_pivots_on_swing_series() {
    let bars = impulse();
    let pivots = extract_pivots(&bars, 4.0);
    assert!(pivots.len() >= 8);
    assert!(pivots.windows(2).all(|w| w[0].kind != w[1].kind));
    assert_eq!(pivots[0].kind, PivotKind::High);
}
