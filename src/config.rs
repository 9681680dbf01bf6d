//! TOML-backed engine configuration
//!
//! ```toml
//! preset = "structure"          # or an explicit [weights] table
//! detector_timeout_ms = 2000
//! validate_data = true
//! derive_context = true
//! enabled = ["harmonic", "elliott", "smc"]
//!
//! [advice]
//! min_confidence = 0.5
//!
//! [detectors.smc]
//! bos_lookback = 30
//! ob_near = 0.005
//! ```
//!
//! Every key is optional. Parsing only checks shape; [`ScoringConfig::validate`]
//! and [`ScoringConfig::into_builder`] surface the typed configuration errors.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    scoring::DEFAULT_DETECTOR_TIMEOUT,
    AdviceThresholds, BuiltinDetector, EngineBuilder, Result, ScoringEngine, SignalError,
    WeightConfig, WeightPreset,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// Named weight preset; mutually exclusive with `weights`
    pub preset: Option<String>,
    pub weights: Option<BTreeMap<String, f64>>,
    pub detector_timeout_ms: u64,
    pub validate_data: bool,
    /// Derive RSI and trend from the bars when the caller leaves them out
    pub derive_context: bool,
    /// Detectors to register, in order. All builtins when absent.
    pub enabled: Option<Vec<String>>,
    pub advice: AdviceThresholds,
    /// Per-detector parameter overrides, keyed by detector name
    pub detectors: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            preset: None,
            weights: None,
            detector_timeout_ms: DEFAULT_DETECTOR_TIMEOUT.as_millis() as u64,
            validate_data: true,
            derive_context: false,
            enabled: None,
            advice: AdviceThresholds::default(),
            detectors: BTreeMap::new(),
        }
    }
}

impl ScoringConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SignalError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SignalError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SignalError::ConfigParse(e.to_string()))
    }

    /// Checks that need no detector instances
    pub fn validate(&self) -> Result<()> {
        if self.detector_timeout_ms == 0 {
            return Err(SignalError::InvalidConfig(
                "detector_timeout_ms must be positive".into(),
            ));
        }
        self.advice.validate()?;

        let known = BuiltinDetector::names();
        let enabled = self.enabled_names();
        for name in enabled.iter().chain(self.detectors.keys()) {
            if !known.contains(&name.as_str()) {
                return Err(SignalError::UnknownDetector(name.clone()));
            }
        }

        self.weight_config()?;
        Ok(())
    }

    /// Resolved weights: explicit table, named preset or the balanced default
    pub fn weight_config(&self) -> Result<WeightConfig> {
        match (&self.weights, &self.preset) {
            (Some(_), Some(_)) => Err(SignalError::InvalidConfig(
                "set either `weights` or `preset`, not both".into(),
            )),
            (Some(table), None) => WeightConfig::new(table.clone()),
            (None, Some(name)) => Ok(WeightPreset::from_name(name)?.weights()),
            (None, None) => Ok(WeightConfig::default()),
        }
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    fn enabled_names(&self) -> Vec<String> {
        match &self.enabled {
            Some(names) => names.clone(),
            None => BuiltinDetector::names().into_iter().map(String::from).collect(),
        }
    }

    /// Instantiate the configured detectors and carry the settings over
    pub fn into_builder(self) -> Result<EngineBuilder> {
        self.validate()?;

        let mut builder = EngineBuilder::new();
        for name in self.enabled_names() {
            let params: HashMap<&str, f64> = self
                .detectors
                .get(&name)
                .map(|table| table.iter().map(|(k, v)| (k.as_str(), *v)).collect())
                .unwrap_or_default();
            builder = builder.add_checked(BuiltinDetector::from_params(&name, &params)?)?;
        }

        builder = builder
            .weights(self.weight_config()?)
            .detector_timeout(self.detector_timeout())
            .validate_data(self.validate_data)
            .thresholds(self.advice);
        if self.derive_context {
            builder = builder.derive_context();
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<ScoringEngine> {
        self.into_builder()?.build()
    }
}
