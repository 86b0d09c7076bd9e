//! One-Euro adaptive low-pass filter
//!
//! The cutoff frequency of the smoothing stage rises with the (smoothed) speed
//! of the signal: slow movements are heavily smoothed to remove jitter, fast
//! movements are followed with little lag.
//!
//! Timestamps are milliseconds. Each instance filters one vector signal; the
//! components are smoothed independently but share the time base.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Cutoff of the derivative smoothing stage, in Hz
const DERIVATIVE_CUTOFF: f64 = 1.0;

/// Tuning parameters of the filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Cutoff used when the signal is still. Lower values smooth more at low speed.
    pub min_cut_off: f64,
    /// Speed coefficient. Higher values reduce lag during fast movements.
    pub beta: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_cut_off: 0.0001,
            beta: 0.01,
        }
    }
}

/// Smoothing factor for time constant `te` and cutoff `cutoff`
#[inline]
fn smoothing_factor(te: f64, cutoff: f64) -> f64 {
    let r = 2.0 * PI * cutoff * te;
    r / (r + 1.0)
}

#[inline]
fn exponential_smoothing(a: f64, x: f64, x_prev: f64) -> f64 {
    a * x + (1.0 - a) * x_prev
}

/// History kept between two samples
#[derive(Debug, Clone)]
struct FilterState {
    previous_value: Vec<f64>,
    previous_derivative: Vec<f64>,
    previous_timestamp: f64,
}

/// Adaptive low-pass filter over a vector signal
#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    params: FilterParams,
    state: Option<FilterState>,
    smoothed: Vec<f64>,
}

impl OneEuroFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            params,
            state: None,
            smoothed: Vec::new(),
        }
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    /// Whether a previous sample is available
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Drop the history so the next sample starts a fresh signal.
    ///
    /// Must be called when tracking is lost, otherwise the reacquired pose is
    /// blended with the pose from before the gap.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Filter `x` sampled at `timestamp_ms`.
    ///
    /// The first sample (and any sample after [`reset`](Self::reset) or with a
    /// different dimension) is returned unchanged. A sample whose timestamp is not
    /// strictly after the previous one is passed through raw without touching the
    /// history.
    pub fn filter(&mut self, timestamp_ms: f64, x: &[f64]) -> &[f64] {
        let same_dimension = self
            .state
            .as_ref()
            .is_some_and(|state| state.previous_value.len() == x.len());
        if !same_dimension {
            self.state = Some(FilterState {
                previous_value: x.to_vec(),
                previous_derivative: vec![0.0; x.len()],
                previous_timestamp: timestamp_ms,
            });
            self.smoothed.clear();
            self.smoothed.extend_from_slice(x);
            return &self.smoothed;
        }

        let params = self.params;
        self.smoothed.clear();
        let Some(state) = self.state.as_mut() else {
            self.smoothed.extend_from_slice(x);
            return &self.smoothed;
        };

        let te = timestamp_ms - state.previous_timestamp;
        if te <= 0.0 || !te.is_finite() {
            self.smoothed.extend_from_slice(x);
            return &self.smoothed;
        }

        let ad = smoothing_factor(te, DERIVATIVE_CUTOFF);

        for (i, &xi) in x.iter().enumerate() {
            // filtered derivative of the signal
            let dx = (xi - state.previous_value[i]) / te;
            let dx_hat = exponential_smoothing(ad, dx, state.previous_derivative[i]);

            // filtered signal
            let cutoff = params.min_cut_off + params.beta * dx_hat.abs();
            let a = smoothing_factor(te, cutoff);
            let x_hat = exponential_smoothing(a, xi, state.previous_value[i]);

            state.previous_derivative[i] = dx_hat;
            state.previous_value[i] = x_hat;
            self.smoothed.push(x_hat);
        }
        state.previous_timestamp = timestamp_ms;

        &self.smoothed
    }
}

impl Default for OneEuroFilter {
    fn default() -> Self {
        Self::new(FilterParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_is_identity() {
        let mut filter = OneEuroFilter::default();
        let x = [0.25, -3.5, 1e6, 0.0];
        assert_eq!(filter.filter(1000.0, &x), &x);
        assert!(filter.is_initialized());
    }

    #[test]
    fn test_converges_to_constant_input() {
        let mut filter = OneEuroFilter::new(FilterParams {
            min_cut_off: 0.001,
            beta: 0.0,
        });
        filter.filter(0.0, &[0.0, 10.0]);

        let target = [5.0, -5.0];
        let mut last_error = f64::INFINITY;
        for step in 1..200 {
            let out = filter.filter(step as f64 * 16.0, &target).to_vec();
            let error = (out[0] - target[0]).abs() + (out[1] - target[1]).abs();
            assert!(
                error < last_error,
                "error grew at step {}: {} >= {}",
                step,
                error,
                last_error
            );
            last_error = error;
        }
        assert!(last_error < 1e-3, "did not converge: {}", last_error);
    }

    #[test]
    fn test_non_positive_dt_passes_through() {
        let mut filter = OneEuroFilter::default();
        filter.filter(100.0, &[1.0]);
        assert_eq!(filter.filter(100.0, &[7.0]), &[7.0]);
        assert_eq!(filter.filter(50.0, &[9.0]), &[9.0]);

        // history untouched: the next valid sample is smoothed against 1.0
        let out = filter.filter(116.0, &[2.0])[0];
        assert!(out > 1.0 && out < 2.0, "unexpected output {}", out);
    }

    #[test]
    fn test_matches_reference_step() {
        let params = FilterParams {
            min_cut_off: 0.5,
            beta: 0.1,
        };
        let mut filter = OneEuroFilter::new(params);
        filter.filter(0.0, &[0.0]);
        let out = filter.filter(10.0, &[1.0])[0];

        let ad = smoothing_factor(10.0, 1.0);
        let dx_hat = ad * 0.1;
        let a = smoothing_factor(10.0, 0.5 + 0.1 * dx_hat);
        assert!((out - a).abs() < 1e-12);
    }

    #[test]
    fn test_reset_restarts_signal() {
        let mut filter = OneEuroFilter::default();
        filter.filter(0.0, &[0.0]);
        filter.filter(16.0, &[100.0]);

        filter.reset();
        assert!(!filter.is_initialized());
        assert_eq!(filter.filter(32.0, &[42.0]), &[42.0]);
    }

    #[test]
    fn test_dimension_change_reinitializes() {
        let mut filter = OneEuroFilter::default();
        filter.filter(0.0, &[1.0, 2.0]);
        assert_eq!(filter.filter(16.0, &[3.0, 4.0, 5.0]), &[3.0, 4.0, 5.0]);
    }
}
