//! Shared numeric helpers and Fibonacci constants for the detector modules

use crate::{Result, SignalError};

// ============================================================
// FIBONACCI LEVELS
// ============================================================

pub const FIB_382: f64 = 0.382;
pub const FIB_500: f64 = 0.5;
pub const FIB_618: f64 = 0.618;
pub const FIB_786: f64 = 0.786;
pub const FIB_886: f64 = 0.886;
pub const FIB_1000: f64 = 1.0;
pub const FIB_1270: f64 = 1.27;
pub const FIB_1618: f64 = 1.618;
pub const FIB_2618: f64 = 2.618;
pub const FIB_3618: f64 = 3.618;

// ============================================================
// HELPER FUNCTIONS
// ============================================================

/// Fail with `InsufficientData` when fewer than `need` bars are available
#[inline]
pub fn ensure_min_bars(got: usize, need: usize) -> Result<()> {
    if got < need {
        return Err(SignalError::InsufficientData { need, got });
    }
    Ok(())
}

/// Clamp into `[lo, hi]`, mapping NaN to `lo`
#[inline]
pub fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

#[inline]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// |a - b| / |b|, infinite when `b` is zero
#[inline]
pub fn relative_distance(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return f64::INFINITY;
    }
    (a - b).abs() / b.abs()
}

/// Highest high over a slice of bars
#[inline]
pub fn max_high<T: crate::OHLCV>(bars: &[T]) -> f64 {
    bars.iter().map(|b| b.high()).fold(f64::NEG_INFINITY, f64::max)
}

/// Lowest low over a slice of bars
#[inline]
pub fn min_low<T: crate::OHLCV>(bars: &[T]) -> f64 {
    bars.iter().map(|b| b.low()).fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bar;

    #[test]
    fn test_clip() {
        assert_eq!(clip(1.5, -1.0, 1.0), 1.0);
        assert_eq!(clip(-3.0, -1.0, 1.0), -1.0);
        assert_eq!(clip(f64::NAN, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_ensure_min_bars() {
        assert!(ensure_min_bars(100, 100).is_ok());
        assert_eq!(
            ensure_min_bars(10, 50),
            Err(SignalError::InsufficientData { need: 50, got: 10 })
        );
    }

    #[test]
    fn test_extremes() {
        let bars = vec![
            Bar::new(10.0, 12.0, 9.0, 11.0, 1.0),
            Bar::new(11.0, 15.0, 10.0, 14.0, 1.0),
        ];
        assert_eq!(max_high(&bars), 15.0);
        assert_eq!(min_low(&bars), 9.0);
        assert_eq!(relative_distance(110.0, 100.0), 0.1);
        assert!(relative_distance(1.0, 0.0).is_infinite());
        assert_eq!(mean(&[]), 0.0);
    }
}
