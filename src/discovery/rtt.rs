//! Round-trip time estimation for super peers.
//!
//! Samples are the latency measured when an acknowledgement echoes the time
//! of our hello. Smoothing follows RFC 6298, so a single slow reply does not
//! immediately flip the default gateway.

use std::time::Duration;

/// Smoothing factor of the RTT average (1/8).
const SRTT_ALPHA: f64 = 0.125;

/// Smoothing factor of the RTT variance (1/4).
const RTTVAR_BETA: f64 = 0.25;

/// Variance multiplier of the timeout.
const RTO_K: f64 = 4.0;

/// Lower bound of the variance term, in milliseconds.
const MIN_GRANULARITY_MS: f64 = 100.0;

/// RFC 6298 RTT estimator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    samples: u64,
}

impl RttEstimator {
    /// Estimator without samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a latency sample in milliseconds.
    pub fn update(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;

        if self.samples == 0 {
            self.srtt_ms = sample;
            self.rttvar_ms = sample / 2.0;
        } else {
            self.rttvar_ms =
                (1.0 - RTTVAR_BETA) * self.rttvar_ms + RTTVAR_BETA * (self.srtt_ms - sample).abs();
            self.srtt_ms = (1.0 - SRTT_ALPHA) * self.srtt_ms + SRTT_ALPHA * sample;
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Smoothed RTT in whole milliseconds, `None` before the first sample.
    pub fn latency_ms(&self) -> Option<u64> {
        self.is_initialized().then(|| self.srtt_ms.round() as u64)
    }

    /// Smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt_ms / 1000.0)
    }

    /// RTT variance.
    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar_ms / 1000.0)
    }

    /// Timeout derived from the estimate (`SRTT + max(G, K * RTTVAR)`).
    pub fn rto(&self) -> Duration {
        let rto_ms = self.srtt_ms + f64::max(MIN_GRANULARITY_MS, RTO_K * self.rttvar_ms);
        Duration::from_millis(rto_ms as u64)
    }

    /// Whether at least one sample was seen.
    pub fn is_initialized(&self) -> bool {
        self.samples > 0
    }

    /// Number of samples seen.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized() {
        let rtt = RttEstimator::new();
        assert!(!rtt.is_initialized());
        assert_eq!(rtt.latency_ms(), None);
    }

    #[test]
    fn test_first_sample() {
        let mut rtt = RttEstimator::new();
        rtt.update(100);

        assert_eq!(rtt.latency_ms(), Some(100));
        // 100 + max(100, 4 * 50)
        assert_eq!(rtt.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_smoothing() {
        let mut rtt = RttEstimator::new();
        rtt.update(100);
        rtt.update(200);

        // SRTT = 0.875 * 100 + 0.125 * 200
        assert_eq!(rtt.latency_ms(), Some(113));
        assert_eq!(rtt.samples(), 2);
    }

    #[test]
    fn test_converges_to_stable_latency() {
        let mut rtt = RttEstimator::new();
        rtt.update(500);
        for _ in 0..100 {
            rtt.update(20);
        }
        assert_eq!(rtt.latency_ms(), Some(20));
    }
}
