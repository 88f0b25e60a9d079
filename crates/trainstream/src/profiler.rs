//! Per-application runtime cost model.

use std::collections::VecDeque;

/// Linear model of training time over data size, fitted by ordinary least
/// squares on a bounded window of observed runs.
///
/// Until the window holds [`Self::threshold`] samples the model keeps the
/// backend-provided `(alpha, beta)`.
#[derive(Debug, Clone)]
pub struct RuntimeProfiler {
    max_samples: usize,
    threshold: usize,
    alpha: f64,
    beta: f64,
    /// `(training_time_ms, data_size)` pairs, oldest first.
    samples: VecDeque<(i64, i64)>,
}

const DEFAULT_MAX_SAMPLES: usize = 10;
const DEFAULT_THRESHOLD: usize = 3;

impl RuntimeProfiler {
    /// New profiler seeded with the backend's initial parameters.
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self::with_window(alpha, beta, DEFAULT_MAX_SAMPLES, DEFAULT_THRESHOLD)
    }

    pub fn with_window(alpha: f64, beta: f64, max_samples: usize, threshold: usize) -> Self {
        Self {
            max_samples,
            threshold,
            alpha,
            beta,
            samples: VecDeque::with_capacity(max_samples),
        }
    }

    /// Record one measured run, evicting the oldest sample when full, and
    /// refit the model once enough samples are present.
    pub fn add_sample(&mut self, training_time_ms: i64, data_size: i64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((training_time_ms, data_size));

        if self.samples.len() >= self.threshold {
            self.fit();
        }
    }

    /// Current `(alpha, beta)`.
    pub fn alpha_beta(&self) -> (f64, f64) {
        (self.alpha, self.beta)
    }

    fn fit(&mut self) {
        let n = self.samples.len() as i64;
        let mut sum_time: i64 = 0;
        let mut sum_size: i64 = 0;
        let mut sum_size_time: i64 = 0;
        let mut sum_size_sq: i64 = 0;
        for &(time, size) in &self.samples {
            sum_time += time;
            sum_size += size;
            sum_size_time += size * time;
            sum_size_sq += size * size;
        }

        let denominator = n * sum_size_sq - sum_size * sum_size;
        if denominator == 0 {
            // All sizes identical; the slope is undefined, keep the model.
            return;
        }
        self.alpha = (n * sum_size_time - sum_time * sum_size) as f64 / denominator as f64;
        self.beta = sum_time as f64 / n as f64 - self.alpha * sum_size as f64 / n as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_seed_parameters_below_threshold() {
        let mut profiler = RuntimeProfiler::new(2.0, 5.0);
        profiler.add_sample(100, 10);
        profiler.add_sample(200, 20);
        assert_eq!(profiler.alpha_beta(), (2.0, 5.0));
    }

    #[test]
    fn fits_exact_line_at_threshold() {
        // time = 3 * size + 7
        let mut profiler = RuntimeProfiler::new(1.0, 1.0);
        for size in [10, 20, 30] {
            profiler.add_sample(3 * size + 7, size);
        }
        let (alpha, beta) = profiler.alpha_beta();
        assert!((alpha - 3.0).abs() < 1e-9);
        assert!((beta - 7.0).abs() < 1e-9);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let mut profiler = RuntimeProfiler::with_window(1.0, 1.0, 3, 3);
        // Three points on time = size.
        for size in [1, 2, 3] {
            profiler.add_sample(size, size);
        }
        // Push the window onto time = 2 * size; the size=1 point falls out.
        for size in [4, 5, 6] {
            profiler.add_sample(2 * size, size);
        }
        let (alpha, beta) = profiler.alpha_beta();
        assert!((alpha - 2.0).abs() < 1e-9);
        assert!(beta.abs() < 1e-9);
    }

    #[test]
    fn identical_sizes_leave_model_unchanged() {
        let mut profiler = RuntimeProfiler::new(1.5, 2.5);
        for _ in 0..4 {
            profiler.add_sample(100, 10);
        }
        assert_eq!(profiler.alpha_beta(), (1.5, 2.5));
    }
}
