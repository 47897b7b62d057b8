//! Time-series load prediction over a bounded sliding window.
//!
//! Each dispatcher feeds its latest load score into a [`LoadPredictor`].
//! The window is bounded both by point count and by age; prediction blends
//! an exponential moving average (recent momentum) with an ordinary
//! least-squares trend extrapolation (sustained drift).

use std::collections::VecDeque;

const DEFAULT_WINDOW_SIZE: usize = 100;
const DEFAULT_WINDOW_DURATION_MS: u64 = 60_000;
const DEFAULT_SMOOTHING_FACTOR: f64 = 0.3;

/// Default prediction horizon: 5 minutes.
pub const DEFAULT_HORIZON_MS: u32 = 300_000;

// Blend of the two estimators: EMA dominates, regression corrects for trend.
const EMA_BLEND_WEIGHT: f64 = 0.7;
const REGRESSION_BLEND_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
struct LoadPoint {
    load_score: f64,
    timestamp_ms: u64,
}

/// Per-dispatcher load forecaster.
///
/// `update_load` and `predict_load` both prune points older than the window
/// duration. EMA and regression results are cached and recomputed lazily
/// only after new data invalidates them, so any predict call between updates
/// is O(1).
#[derive(Debug)]
pub struct LoadPredictor {
    current_load: f64,
    average_load: f64,
    max_load: f64,
    min_load: f64,

    window: VecDeque<LoadPoint>,
    window_size: usize,
    window_duration_ms: u64,

    smoothing_factor: f64,
    cached_ema: Option<f64>,
    // (slope, intercept) of load over timestamp
    cached_regression: Option<(f64, f64)>,
}

impl Default for LoadPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadPredictor {
    pub fn new() -> Self {
        Self {
            current_load: 0.0,
            average_load: 0.0,
            max_load: 0.0,
            min_load: 0.0,
            window: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE),
            window_size: DEFAULT_WINDOW_SIZE,
            window_duration_ms: DEFAULT_WINDOW_DURATION_MS,
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
            cached_ema: None,
            cached_regression: None,
        }
    }

    /// Record a new load observation.
    ///
    /// Prunes aged-out points, appends the new one, enforces the point-count
    /// bound, recomputes the running average/min/max over the retained
    /// window and invalidates the cached estimators.
    pub fn update_load(&mut self, load_score: f64, timestamp_ms: u64) {
        self.current_load = load_score;

        self.prune_old_data(timestamp_ms);

        self.window.push_back(LoadPoint {
            load_score,
            timestamp_ms,
        });
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        self.recompute_window_stats();

        self.cached_ema = None;
        self.cached_regression = None;
    }

    /// Forecast the load `horizon_ms` past the latest observation.
    ///
    /// ## Algorithm
    /// 1. Empty window: 0.0. Fewer than two points: the latest raw load (no
    ///    extrapolation possible).
    /// 2. EMA over the window with the configured smoothing factor.
    /// 3. OLS regression of score against timestamp, extrapolated to
    ///    `last_timestamp + horizon_ms`; mean fallback on zero time-variance.
    /// 4. `0.7 * EMA + 0.3 * regression forecast`.
    pub fn predict_load(&mut self, horizon_ms: u32) -> f64 {
        let Some(last) = self.window.back() else {
            return 0.0;
        };
        let last_timestamp = last.timestamp_ms;

        self.prune_old_data(last_timestamp);

        if self.window.len() < 2 {
            return self.current_load;
        }

        let ema = self.calculate_ema();
        let trend = self.calculate_regression_forecast(last_timestamp + u64::from(horizon_ms));

        EMA_BLEND_WEIGHT * ema + REGRESSION_BLEND_WEIGHT * trend
    }

    pub fn current_load(&self) -> f64 {
        self.current_load
    }

    pub fn average_load(&self) -> f64 {
        self.average_load
    }

    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    pub fn min_load(&self) -> f64 {
        self.min_load
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn set_window_size(&mut self, size: usize) {
        self.window_size = size.max(1);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        self.cached_ema = None;
        self.cached_regression = None;
    }

    pub fn set_smoothing_factor(&mut self, alpha: f64) {
        self.smoothing_factor = alpha.clamp(0.0, 1.0);
        self.cached_ema = None;
    }

    /// Drop every point older than `current_timestamp - window_duration`.
    fn prune_old_data(&mut self, current_timestamp: u64) {
        let cutoff = current_timestamp.saturating_sub(self.window_duration_ms);
        while let Some(front) = self.window.front() {
            if front.timestamp_ms > cutoff {
                break;
            }
            self.window.pop_front();
        }
    }

    fn recompute_window_stats(&mut self) {
        if self.window.is_empty() {
            self.average_load = 0.0;
            self.max_load = 0.0;
            self.min_load = 0.0;
            return;
        }

        let mut sum = 0.0;
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for point in &self.window {
            sum += point.load_score;
            max = max.max(point.load_score);
            min = min.min(point.load_score);
        }
        self.average_load = sum / self.window.len() as f64;
        self.max_load = max;
        self.min_load = min;
    }

    fn calculate_ema(&mut self) -> f64 {
        if let Some(ema) = self.cached_ema {
            return ema;
        }

        let mut iter = self.window.iter();
        let mut ema = match iter.next() {
            Some(point) => point.load_score,
            None => return 0.0,
        };
        for point in iter {
            ema = self.smoothing_factor * point.load_score + (1.0 - self.smoothing_factor) * ema;
        }

        self.cached_ema = Some(ema);
        ema
    }

    fn calculate_regression_forecast(&mut self, future_timestamp_ms: u64) -> f64 {
        if let Some((slope, intercept)) = self.cached_regression {
            return intercept + slope * future_timestamp_ms as f64;
        }

        let n = self.window.len() as f64;
        let mut mean_x = 0.0;
        let mut mean_y = 0.0;
        for point in &self.window {
            mean_x += point.timestamp_ms as f64;
            mean_y += point.load_score;
        }
        mean_x /= n;
        mean_y /= n;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for point in &self.window {
            let x_diff = point.timestamp_ms as f64 - mean_x;
            let y_diff = point.load_score - mean_y;
            numerator += x_diff * y_diff;
            denominator += x_diff * x_diff;
        }

        // All points share one timestamp: no usable trend, fall back to the mean.
        if denominator == 0.0 {
            return mean_y;
        }

        let slope = numerator / denominator;
        let intercept = mean_y - slope * mean_x;
        self.cached_regression = Some((slope, intercept));

        intercept + slope * future_timestamp_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_predicts_zero() {
        let mut predictor = LoadPredictor::new();
        assert_eq!(predictor.predict_load(DEFAULT_HORIZON_MS), 0.0);
    }

    #[test]
    fn single_point_returns_raw_load() {
        let mut predictor = LoadPredictor::new();
        predictor.update_load(0.42, 1_000);
        assert!((predictor.predict_load(60_000) - 0.42).abs() < 1e-9);
    }

    #[test]
    fn constant_sequence_predicts_the_constant() {
        let mut predictor = LoadPredictor::new();
        for i in 0..20u64 {
            predictor.update_load(0.5, 1_000 + i * 500);
        }
        let forecast = predictor.predict_load(60_000);
        assert!((forecast - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rising_sequence_predicts_above_average() {
        let mut predictor = LoadPredictor::new();
        for i in 0..20u64 {
            predictor.update_load(0.05 * i as f64, 1_000 + i * 1_000);
        }

        let near = predictor.predict_load(0);
        let far = predictor.predict_load(30_000);

        // A sustained upward trend pushes the forecast past the window mean,
        // and a longer horizon extrapolates further up.
        assert!(near > predictor.average_load());
        assert!(far > near);
    }

    #[test]
    fn window_prunes_by_age() {
        let mut predictor = LoadPredictor::new();
        predictor.update_load(0.9, 1_000);
        predictor.update_load(0.8, 2_000);
        // 70 seconds later, both earlier points are outside the 60 s window.
        predictor.update_load(0.1, 72_000);

        assert_eq!(predictor.window_len(), 1);
        assert!((predictor.average_load() - 0.1).abs() < 1e-9);
        assert!((predictor.max_load() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn window_bounded_by_point_count() {
        let mut predictor = LoadPredictor::new();
        predictor.set_window_size(10);
        for i in 0..50u64 {
            predictor.update_load(0.3, 10_000 + i * 100);
        }
        assert_eq!(predictor.window_len(), 10);
    }

    #[test]
    fn zero_time_variance_falls_back_to_mean() {
        let mut predictor = LoadPredictor::new();
        predictor.update_load(0.2, 5_000);
        predictor.update_load(0.6, 5_000);

        // EMA = 0.3*0.6 + 0.7*0.2 = 0.32; regression degenerates to mean 0.4.
        let forecast = predictor.predict_load(60_000);
        let expected = 0.7 * 0.32 + 0.3 * 0.4;
        assert!((forecast - expected).abs() < 1e-9);
    }

    #[test]
    fn update_invalidates_cached_forecast() {
        let mut predictor = LoadPredictor::new();
        predictor.update_load(0.5, 1_000);
        predictor.update_load(0.5, 2_000);
        let flat = predictor.predict_load(10_000);

        predictor.update_load(0.9, 3_000);
        let rising = predictor.predict_load(10_000);

        assert!(rising > flat);
    }

    #[test]
    fn min_max_track_retained_window() {
        let mut predictor = LoadPredictor::new();
        predictor.update_load(0.1, 1_000);
        predictor.update_load(0.9, 2_000);
        predictor.update_load(0.4, 3_000);

        assert!((predictor.min_load() - 0.1).abs() < 1e-9);
        assert!((predictor.max_load() - 0.9).abs() < 1e-9);
        assert!((predictor.current_load() - 0.4).abs() < 1e-9);
    }
}
