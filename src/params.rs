//! Tunable detector thresholds
//!
//! Every builtin detector publishes a static table of [`ParamMeta`]. The table
//! is the single source of defaults and admissible ranges: TOML overrides,
//! grid searches and [`ParameterizedDetector::with_params`] all read from it.
//!
//! # Example
//!
//! ```rust
//! use confluence::params::{ParamType, ParameterizedDetector};
//! use confluence::prelude::*;
//!
//! let periods = SmcDetector::param_meta()
//!   .iter()
//!   .filter(|p| p.param_type == ParamType::Period)
//!   .count();
//! assert!(periods > 0);
//! ```

use std::collections::HashMap;

use crate::{Period, Ratio, Result, SignalError};

// ============================================================
// METADATA
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
  /// Fraction in 0.0..=1.0
  Ratio,
  /// Bar count
  Period,
  /// Non-negative float: percent thresholds, RSI levels
  Level,
}

/// One tunable threshold of a detector
#[derive(Debug, Clone)]
pub struct ParamMeta {
  pub name: &'static str,
  pub param_type: ParamType,
  pub default: f64,
  /// (min, max, step); step only drives grid generation
  pub range: (f64, f64, f64),
  pub description: &'static str,
}

impl ParamMeta {
  const fn typed(
    param_type: ParamType,
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type, default, range, description }
  }

  pub const fn ratio(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self::typed(ParamType::Ratio, name, default, range, description)
  }

  pub const fn period(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self::typed(ParamType::Period, name, default, range, description)
  }

  pub const fn level(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self::typed(ParamType::Level, name, default, range, description)
  }

  /// Evenly spaced candidates from min to max, both ends included.
  ///
  /// Points are computed by index so the last one never drifts past `max`.
  pub fn generate_grid(&self) -> Vec<f64> {
    let (min, max, step) = self.range;
    if step.is_nan() || step <= 0.0 || max < min {
      return vec![min];
    }
    let steps = ((max - min) / step + 1e-9).floor() as usize;
    (0..=steps).map(|i| (min + step * i as f64).min(max)).collect()
  }

  pub fn validate(&self, value: f64) -> Result<()> {
    if !value.is_finite() {
      return Err(SignalError::InvalidValue("parameter must be finite"));
    }
    let (min, max, _) = self.range;
    if !(min..=max).contains(&value) {
      return Err(SignalError::OutOfRange { field: self.name, value, min, max });
    }
    match self.param_type {
      ParamType::Ratio => Ratio::new(value).map(drop),
      ParamType::Period if value < 1.0 || value.fract() != 0.0 => {
        Err(SignalError::InvalidValue("period parameters must be positive integers"))
      },
      ParamType::Period | ParamType::Level => Ok(()),
    }
  }
}

/// Name -> default for every entry of a table
pub fn defaults(meta: &[ParamMeta]) -> HashMap<&'static str, f64> {
  meta.iter().map(|m| (m.name, m.default)).collect()
}

// ============================================================
// PARAMETERIZED DETECTOR TRAIT
// ============================================================

/// Detectors constructible from a name -> value map
pub trait ParameterizedDetector: Sized {
  fn param_meta() -> &'static [ParamMeta];

  /// Missing keys take their table default. Unknown keys and out-of-range
  /// values are rejected.
  fn with_params(params: &HashMap<&str, f64>) -> Result<Self>;

  /// Registry name of the detector (also its weight key)
  fn detector_name() -> &'static str;
}

// ============================================================
// CHECKED LOOKUP
// ============================================================

/// A parameter map checked against a metadata table.
///
/// Construction rejects unknown keys and out-of-range values, so the typed
/// getters only fail on names missing from the table itself.
#[derive(Debug)]
pub struct ParamSet<'a> {
  params: &'a HashMap<&'a str, f64>,
  meta: &'static [ParamMeta],
}

impl<'a> ParamSet<'a> {
  pub fn new(params: &'a HashMap<&'a str, f64>, meta: &'static [ParamMeta]) -> Result<Self> {
    for (key, &value) in params {
      let Some(m) = meta.iter().find(|m| m.name == *key) else {
        return Err(SignalError::InvalidConfig(format!("unknown parameter: {key}")));
      };
      m.validate(value)?;
    }
    Ok(Self { params, meta })
  }

  /// Supplied value, else the table default
  pub fn value(&self, name: &str) -> Result<f64> {
    let meta = self
      .meta
      .iter()
      .find(|m| m.name == name)
      .ok_or_else(|| SignalError::InvalidConfig(format!("undeclared parameter: {name}")))?;
    Ok(self.params.get(name).copied().unwrap_or(meta.default))
  }

  pub fn ratio(&self, name: &str) -> Result<Ratio> {
    Ratio::new(self.value(name)?)
  }

  pub fn period(&self, name: &str) -> Result<Period> {
    Period::new(self.value(name)? as usize)
  }

  pub fn level(&self, name: &str) -> Result<f64> {
    self.value(name)
  }
}

// ============================================================
// TESTS
// ============================================================
