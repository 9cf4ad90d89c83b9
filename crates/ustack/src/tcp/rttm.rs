//! Round-trip time measurement, Jacobson/Karels as revised by RFC 6298.

use std::time::Duration;

/// Clock granularity, seconds.
const CLOCK_G: f64 = 0.001;

const K: f64 = 4.0;
const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

/// Ceiling applied when backing off after a retransmission timeout.
const RTO_MAX: f64 = 64.0;

#[derive(Debug, Clone)]
pub struct Rttm {
    /// Smoothed round-trip time, seconds.
    srtt: f64,
    /// Round-trip time variation, seconds.
    rttvar: f64,
    /// Current retransmission timeout, seconds.
    rto: f64,
    /// When the in-flight measurement started.
    started: Option<Duration>,
    samples: u32,
}

impl Rttm {
    pub fn new() -> Self {
        Rttm {
            srtt: 1.0,
            rttvar: 1.0,
            rto: 1.0,
            started: None,
            samples: 0,
        }
    }

    /// Whether a measurement is in flight.
    pub fn active(&self) -> bool {
        self.started.is_some()
    }

    /// Begin timing a segment. Only one sample is taken at a time.
    pub fn start(&mut self, now: Duration) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    /// Finish the in-flight measurement, if any.
    pub fn stop(&mut self, now: Duration) {
        if let Some(t0) = self.started.take() {
            self.measure(now.saturating_sub(t0));
        }
    }

    /// Abandon the in-flight measurement (Karn: never sample a
    /// retransmitted segment).
    pub fn clear(&mut self) {
        self.started = None;
    }

    /// Feed one RTT sample.
    pub fn measure(&mut self, r: Duration) {
        let r = r.as_secs_f64();
        if self.samples == 0 {
            // RFC 6298 2.2: first measurement.
            self.srtt = r;
            self.rttvar = r / 2.0;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        }
        self.samples += 1;
        self.rto = self.compute_rto();
    }

    /// RFC 6298 2.4: `max(SRTT + max(G, K*RTTVAR), 1s)`.
    fn compute_rto(&self) -> f64 {
        (self.srtt + CLOCK_G.max(K * self.rttvar)).max(1.0)
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.rto)
    }

    /// Double the timeout after a retransmission expiry, capped.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(RTO_MAX);
    }

    /// Reset the timeout to the computed value (recovery over).
    pub fn update_rto(&mut self) {
        self.rto = self.compute_rto();
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt)
    }
}

impl Default for Rttm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rto_is_one_second() {
        assert_eq!(Rttm::new().rto(), Duration::from_secs(1));
    }

    #[test]
    fn test_first_sample_seeds_srtt() {
        let mut rttm = Rttm::new();
        rttm.measure(Duration::from_millis(200));
        assert!((rttm.srtt().as_secs_f64() - 0.2).abs() < 1e-9);
        // 0.2 + 4 * 0.1 = 0.6, floored to the 1 second minimum
        assert_eq!(rttm.rto(), Duration::from_secs(1));
    }

    #[test]
    fn test_converges_on_steady_rtt() {
        let mut rttm = Rttm::new();
        for _ in 0..50 {
            rttm.measure(Duration::from_millis(100));
        }
        let srtt = rttm.srtt().as_secs_f64();
        assert!((srtt - 0.1).abs() < 0.01, "srtt was {srtt}");
        assert_eq!(rttm.rto(), Duration::from_secs(1)); // floor
    }

    #[test]
    fn test_slow_path_raises_rto() {
        let mut rttm = Rttm::new();
        for _ in 0..20 {
            rttm.measure(Duration::from_secs(2));
        }
        assert!(rttm.rto() >= Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut rttm = Rttm::new();
        rttm.backoff();
        assert_eq!(rttm.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            rttm.backoff();
        }
        assert_eq!(rttm.rto(), Duration::from_secs(64));
    }

    #[test]
    fn test_start_stop_measures_elapsed() {
        let mut rttm = Rttm::new();
        rttm.start(Duration::from_millis(100));
        assert!(rttm.active());
        rttm.stop(Duration::from_millis(350));
        assert!(!rttm.active());
        assert_eq!(rttm.samples(), 1);
        assert!((rttm.srtt().as_secs_f64() - 0.25).abs() < 1e-9);
    }
}
