//! Per-dispatcher load signals and the weighted load score.
//!
//! Twelve independent signals, each updated by the owning dispatcher through
//! a dedicated setter. Ratio-type signals are clamped to `[0, 1]` on write;
//! count and time signals are stored raw and normalized against fixed
//! saturation constants at scoring time.

// Weights for each signal (sum to 1.0)
const WEIGHT_CPU_LOAD: f64 = 0.15;
const WEIGHT_THREAD_UTILIZATION: f64 = 0.1;
const WEIGHT_CONTEXT_SWITCH_RATE: f64 = 0.05;
const WEIGHT_IO_WAIT_TIME: f64 = 0.1;
const WEIGHT_PACKET_RATE: f64 = 0.1;
const WEIGHT_BANDWIDTH_USAGE: f64 = 0.05;
const WEIGHT_CONNECTION_COUNT: f64 = 0.15;
const WEIGHT_MEMORY_POOL_USAGE: f64 = 0.1;
const WEIGHT_CACHE_HIT_RATE: f64 = 0.05;
const WEIGHT_TASK_QUEUE_LENGTH: f64 = 0.05;
const WEIGHT_RESPONSE_TIME: f64 = 0.05;
const WEIGHT_ERROR_RATE: f64 = 0.05;

// Saturation constants used to normalize unbounded signals to [0, 1]
const SATURATION_CONTEXT_SWITCHES_PER_SEC: f64 = 100_000.0;
const SATURATION_IO_WAIT_US: f64 = 1_000_000.0;
const SATURATION_PACKETS_PER_SEC: f64 = 1_000_000.0;
const SATURATION_CONNECTIONS: f64 = 10_000.0;
const SATURATION_QUEUE_LENGTH: f64 = 1_000.0;
const SATURATION_RESPONSE_TIME_US: f64 = 1_000_000.0;

/// Snapshot of a single dispatcher's load signals.
///
/// Owned and mutated by exactly one dispatcher; `calculate_load_score`
/// produces the single comparable load figure every downstream component
/// ranks on.
#[derive(Debug, Default, Clone)]
pub struct LoadMetrics {
    // CPU signals
    cpu_load: f64,
    thread_utilization: f64,
    context_switch_rate: u32,

    // IO signals
    io_wait_time_us: u64,
    packet_rate: u32,
    bandwidth_usage: f64,

    // Connection signals
    connection_count: u32,

    // Memory signals
    memory_pool_usage: f64,
    cache_hit_rate: f64,

    // Task signals
    task_queue_length: u32,
    response_time_us: u64,

    // Error signals
    error_rate: f64,
}

fn clamp_ratio(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_cpu_load(&mut self, load: f64) {
        self.cpu_load = clamp_ratio(load);
    }

    pub fn update_thread_utilization(&mut self, utilization: f64) {
        self.thread_utilization = clamp_ratio(utilization);
    }

    pub fn update_context_switch_rate(&mut self, rate: u32) {
        self.context_switch_rate = rate;
    }

    pub fn update_io_wait_time(&mut self, time_us: u64) {
        self.io_wait_time_us = time_us;
    }

    pub fn update_packet_rate(&mut self, rate: u32) {
        self.packet_rate = rate;
    }

    pub fn update_bandwidth_usage(&mut self, usage: f64) {
        self.bandwidth_usage = clamp_ratio(usage);
    }

    pub fn update_connection_count(&mut self, count: u32) {
        self.connection_count = count;
    }

    pub fn update_memory_pool_usage(&mut self, usage: f64) {
        self.memory_pool_usage = clamp_ratio(usage);
    }

    pub fn update_cache_hit_rate(&mut self, rate: f64) {
        self.cache_hit_rate = clamp_ratio(rate);
    }

    pub fn update_task_queue_length(&mut self, length: u32) {
        self.task_queue_length = length;
    }

    pub fn update_response_time(&mut self, time_us: u64) {
        self.response_time_us = time_us;
    }

    pub fn update_error_rate(&mut self, rate: f64) {
        self.error_rate = clamp_ratio(rate);
    }

    pub fn cpu_load(&self) -> f64 {
        self.cpu_load
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count
    }

    pub fn task_queue_length(&self) -> u32 {
        self.task_queue_length
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.cache_hit_rate
    }

    /// Reduce all twelve signals to one load score in `[0, 1]`.
    ///
    /// ## Algorithm
    /// Every signal is normalized to `[0, 1]` (unbounded signals saturate at
    /// fixed constants, cache hit rate inverts to a miss rate), then combined
    /// as a fixed-weight sum. Inputs are sanitized at write time, so there
    /// are no error conditions.
    pub fn calculate_load_score(&self) -> f64 {
        let context_switch_rate =
            (f64::from(self.context_switch_rate) / SATURATION_CONTEXT_SWITCHES_PER_SEC).min(1.0);
        let io_wait_time = (self.io_wait_time_us as f64 / SATURATION_IO_WAIT_US).min(1.0);
        let packet_rate = (f64::from(self.packet_rate) / SATURATION_PACKETS_PER_SEC).min(1.0);
        let connection_count = (f64::from(self.connection_count) / SATURATION_CONNECTIONS).min(1.0);
        // Higher cache miss rate increases load
        let cache_miss_rate = 1.0 - self.cache_hit_rate;
        let task_queue_length =
            (f64::from(self.task_queue_length) / SATURATION_QUEUE_LENGTH).min(1.0);
        let response_time = (self.response_time_us as f64 / SATURATION_RESPONSE_TIME_US).min(1.0);

        let score = WEIGHT_CPU_LOAD * self.cpu_load
            + WEIGHT_THREAD_UTILIZATION * self.thread_utilization
            + WEIGHT_CONTEXT_SWITCH_RATE * context_switch_rate
            + WEIGHT_IO_WAIT_TIME * io_wait_time
            + WEIGHT_PACKET_RATE * packet_rate
            + WEIGHT_BANDWIDTH_USAGE * self.bandwidth_usage
            + WEIGHT_CONNECTION_COUNT * connection_count
            + WEIGHT_MEMORY_POOL_USAGE * self.memory_pool_usage
            + WEIGHT_CACHE_HIT_RATE * cache_miss_rate
            + WEIGHT_TASK_QUEUE_LENGTH * task_queue_length
            + WEIGHT_RESPONSE_TIME * response_time
            + WEIGHT_ERROR_RATE * self.error_rate;

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let sum = WEIGHT_CPU_LOAD
            + WEIGHT_THREAD_UTILIZATION
            + WEIGHT_CONTEXT_SWITCH_RATE
            + WEIGHT_IO_WAIT_TIME
            + WEIGHT_PACKET_RATE
            + WEIGHT_BANDWIDTH_USAGE
            + WEIGHT_CONNECTION_COUNT
            + WEIGHT_MEMORY_POOL_USAGE
            + WEIGHT_CACHE_HIT_RATE
            + WEIGHT_TASK_QUEUE_LENGTH
            + WEIGHT_RESPONSE_TIME
            + WEIGHT_ERROR_RATE;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn idle_metrics_score_only_cache_miss() {
        // A fresh instance reports full cache miss (hit rate 0.0), nothing else.
        let metrics = LoadMetrics::new();
        let score = metrics.calculate_load_score();
        assert!((score - WEIGHT_CACHE_HIT_RATE).abs() < 1e-9);
    }

    #[test]
    fn saturated_metrics_score_one() {
        let mut metrics = LoadMetrics::new();
        metrics.update_cpu_load(1.0);
        metrics.update_thread_utilization(1.0);
        metrics.update_context_switch_rate(200_000);
        metrics.update_io_wait_time(2_000_000);
        metrics.update_packet_rate(2_000_000);
        metrics.update_bandwidth_usage(1.0);
        metrics.update_connection_count(20_000);
        metrics.update_memory_pool_usage(1.0);
        metrics.update_cache_hit_rate(0.0);
        metrics.update_task_queue_length(2_000);
        metrics.update_response_time(2_000_000);
        metrics.update_error_rate(1.0);

        assert!((metrics.calculate_load_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ratio_inputs_are_clamped() {
        let mut metrics = LoadMetrics::new();
        metrics.update_cpu_load(3.5);
        assert!((metrics.cpu_load() - 1.0).abs() < 1e-9);
        metrics.update_cpu_load(-0.5);
        assert!(metrics.cpu_load().abs() < 1e-9);

        metrics.update_cache_hit_rate(1.7);
        assert!((metrics.cache_hit_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_always_within_bounds() {
        let mut metrics = LoadMetrics::new();
        metrics.update_cpu_load(0.5);
        metrics.update_connection_count(u32::MAX);
        metrics.update_io_wait_time(u64::MAX);
        metrics.update_response_time(u64::MAX);
        metrics.update_cache_hit_rate(1.0);

        let score = metrics.calculate_load_score();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn higher_cache_hit_rate_lowers_score() {
        let mut cold = LoadMetrics::new();
        cold.update_cache_hit_rate(0.1);
        let mut warm = LoadMetrics::new();
        warm.update_cache_hit_rate(0.9);

        assert!(warm.calculate_load_score() < cold.calculate_load_score());
    }
}
