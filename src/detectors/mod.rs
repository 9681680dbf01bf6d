//! Signal detectors
//!
//! # Detector Families
//!
//! - **Harmonic**: XABCD Fibonacci patterns (Butterfly, Bat, Gartley, Crab)
//! - **Elliott**: five-wave impulse counts over recent swing points
//! - **SMC**: smart money concepts - structure breaks, order blocks, fair value gaps

pub mod helpers;

/// Generate `with_defaults()` -> `Self::default()` for multiple detector types.
macro_rules! impl_with_defaults {
    ($($detector:ty),* $(,)?) => {
        $(impl $detector {
            pub fn with_defaults() -> Self { Self::default() }
        })*
    };
}

pub mod elliott;
pub mod harmonic;
pub mod smc;

impl_with_defaults!(
    harmonic::HarmonicDetector,
    elliott::ElliottDetector,
    smc::SmcDetector,
);

pub use elliott::*;
pub use harmonic::*;
pub use smc::*;
