//! Round-trip time estimation for retransmission decisions.
//!
//! Smoothed RTT and variance follow the RFC 6298 recurrences, with a
//! pessimistic first sample so early retransmits are not spurious.

/// Timing constants, in seconds.
pub mod constants {
    /// Lower bound on the retransmission timeout.
    pub const MIN_RTO: f64 = 0.025;
    /// Upper bound on the retransmission timeout.
    pub const MAX_RTO: f64 = 5.000;
    /// Timeout before any sample has been taken.
    pub const INITIAL_RTO: f64 = MIN_RTO;
    /// Floor for the variance term of the timeout.
    pub const MIN_RTTVAR_TERM: f64 = 0.001;
    /// The first sample is scaled up to seed SRTT conservatively.
    pub const FIRST_SAMPLE_SCALE: f64 = 10.0;
}

use constants::*;

/// RTT estimator (RFC 6298 shaped).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: INITIAL_RTO,
            initialized: false,
        }
    }

    /// Feed one round-trip sample (seconds).
    ///
    /// First sample: `SRTT = 10 * R`, `RTTVAR = R / 2`.
    /// Later: `RTTVAR = (3 * RTTVAR + |SRTT - R|) / 4`, `SRTT = (7 * SRTT + R) / 8`.
    /// Then `RTO = SRTT + max(4 * RTTVAR, 1ms)` clamped to `[MIN_RTO, MAX_RTO]`.
    pub fn update(&mut self, sample: f64) {
        let sample = sample.max(0.0);
        if self.initialized {
            self.rttvar = (3.0 * self.rttvar + (self.srtt - sample).abs()) / 4.0;
            self.srtt = (7.0 * self.srtt + sample) / 8.0;
        } else {
            self.rttvar = sample / 2.0;
            self.srtt = sample * FIRST_SAMPLE_SCALE;
            self.initialized = true;
        }
        let var_term = (4.0 * self.rttvar).max(MIN_RTTVAR_TERM);
        self.rto = (self.srtt + var_term).clamp(MIN_RTO, MAX_RTO);
    }

    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Double the timeout after a timed-out retransmission.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(MAX_RTO);
    }
}
