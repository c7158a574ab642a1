//! Host time to MCU clock mapping.
//!
//! [`ClockSync`] keeps a decaying linear regression of `(send time, MCU
//! clock)` samples gathered from periodic `get_clock` queries. The primary
//! MCU's clock defines print time; [`SecondarySync`] maps another MCU's clock
//! onto that print time with a piecewise-linear adjustment that is refreshed
//! as the two clocks drift.

use std::fmt::Write as _;

use mculink_queue::ClockEstimate;
use tracing::{debug, info};

/// Allowed growth of the minimum round trip, per second of age.
pub const RTT_AGE: f64 = 0.000_010 / (60.0 * 60.0);
/// Weight of each new sample in the running averages.
pub const DECAY: f64 = 1.0 / 30.0;
/// Host-side transmit slack added to the estimate handed to the queue.
pub const TRANSMIT_EXTRA: f64 = 0.001;
/// Interval between periodic `get_clock` queries, in seconds.
pub const CLOCK_QUERY_INTERVAL: f64 = 0.9839;
/// Unanswered queries after which the MCU is considered unresponsive.
pub const MAX_QUERIES_PENDING: u32 = 4;

/// Primary clock synchronization for one MCU.
#[derive(Debug, Clone)]
pub struct ClockSync {
    mcu_freq: f64,
    last_clock: u64,
    // (sample host time, sample clock, frequency)
    clock_est: (f64, f64, f64),
    min_half_rtt: f64,
    min_rtt_time: f64,
    time_avg: f64,
    time_variance: f64,
    clock_avg: f64,
    clock_covariance: f64,
    prediction_variance: f64,
    last_prediction_time: f64,
    queries_pending: u32,
}

impl ClockSync {
    pub fn new(mcu_freq: f64) -> Self {
        Self {
            mcu_freq,
            last_clock: 0,
            clock_est: (0.0, 0.0, mcu_freq),
            min_half_rtt: f64::INFINITY,
            min_rtt_time: 0.0,
            time_avg: 0.0,
            time_variance: 0.0,
            clock_avg: 0.0,
            clock_covariance: 0.0,
            prediction_variance: 0.0,
            last_prediction_time: 0.0,
            queries_pending: 0,
        }
    }

    /// Seed the regression from a `get_uptime` reply.
    pub fn handle_uptime(&mut self, high: u32, clock: u32, sent_time: f64) {
        self.last_clock = (u64::from(high) << 32) | u64::from(clock);
        self.clock_avg = self.last_clock as f64;
        self.time_avg = sent_time;
        self.clock_est = (self.time_avg, self.clock_avg, self.mcu_freq);
        self.prediction_variance = (0.001 * self.mcu_freq).powi(2);
        debug!(clock = self.last_clock, sent_time, "clock sync seeded from uptime");
    }

    /// Accept the next sample even if it looks like an outlier.
    ///
    /// Used for the burst of queries issued while connecting, when the
    /// regression has not settled yet.
    pub fn reset_prediction_window(&mut self) {
        self.last_prediction_time = -9999.0;
    }

    /// A periodic `get_clock` query went out.
    pub fn note_query_sent(&mut self) {
        self.queries_pending += 1;
    }

    pub fn queries_pending(&self) -> u32 {
        self.queries_pending
    }

    /// False once too many clock queries went unanswered.
    pub fn is_active(&self) -> bool {
        self.queries_pending <= MAX_QUERIES_PENDING
    }

    /// Fold a `clock` reply into the regression.
    ///
    /// Returns the estimate the transport should schedule with, or `None`
    /// when the sample was not used.
    pub fn handle_clock(
        &mut self,
        clock32: u32,
        sent_time: f64,
        receive_time: f64,
    ) -> Option<ClockEstimate> {
        self.queries_pending = 0;
        let delta = u64::from(clock32.wrapping_sub(self.last_clock as u32));
        let clock = self.last_clock + delta;
        self.last_clock = clock;
        if sent_time == 0.0 {
            return None;
        }

        let half_rtt = 0.5 * (receive_time - sent_time);
        let aged_rtt = (sent_time - self.min_rtt_time) * RTT_AGE;
        if half_rtt < self.min_half_rtt + aged_rtt {
            self.min_half_rtt = half_rtt;
            self.min_rtt_time = sent_time;
            debug!(half_rtt, sent_time, "new minimum round trip");
        }

        let clock = clock as f64;
        let expected_clock = (sent_time - self.time_avg) * self.clock_est.2 + self.clock_avg;
        let clock_diff2 = (clock - expected_clock).powi(2);
        if clock_diff2 > 25.0 * self.prediction_variance
            && clock_diff2 > (0.000_500 * self.mcu_freq).powi(2)
        {
            if clock > expected_clock && sent_time < self.last_prediction_time + 10.0 {
                debug!(
                    sent_time,
                    clock,
                    expected_clock,
                    stddev = self.prediction_variance.sqrt(),
                    "ignoring clock sample"
                );
                return None;
            }
            info!(
                sent_time,
                clock,
                expected_clock,
                stddev = self.prediction_variance.sqrt(),
                "resetting clock prediction variance"
            );
            self.prediction_variance = (0.001 * self.mcu_freq).powi(2);
        } else {
            self.last_prediction_time = sent_time;
            self.prediction_variance =
                (1.0 - DECAY) * (self.prediction_variance + clock_diff2 * DECAY);
        }

        let diff_sent_time = sent_time - self.time_avg;
        self.time_avg += DECAY * diff_sent_time;
        self.time_variance = (1.0 - DECAY) * (self.time_variance + diff_sent_time.powi(2) * DECAY);
        let diff_clock = clock - self.clock_avg;
        self.clock_avg += DECAY * diff_clock;
        self.clock_covariance =
            (1.0 - DECAY) * (self.clock_covariance + diff_sent_time * diff_clock * DECAY);

        let new_freq = if self.time_variance > 0.0 {
            self.clock_covariance / self.time_variance
        } else {
            self.mcu_freq
        };
        let pred_stddev = self.prediction_variance.sqrt();
        let conv_clock = (self.clock_avg - 3.0 * pred_stddev).max(0.0) as u64;
        let estimate = ClockEstimate::new(
            new_freq,
            self.time_avg + TRANSMIT_EXTRA,
            conv_clock,
            self.last_clock,
        );
        self.clock_est = (self.time_avg + self.min_half_rtt, self.clock_avg, new_freq);
        Some(estimate)
    }

    pub fn mcu_freq(&self) -> f64 {
        self.mcu_freq
    }

    pub fn last_clock(&self) -> u64 {
        self.last_clock
    }

    /// `(sample host time, sample clock, frequency)` of the current estimate.
    pub fn clock_est(&self) -> (f64, f64, f64) {
        self.clock_est
    }

    /// Frequency the regression currently measures.
    pub fn adjusted_freq(&self) -> f64 {
        self.clock_est.2
    }

    /// Estimated MCU clock at host time `eventtime`.
    pub fn get_clock(&self, eventtime: f64) -> u64 {
        let (sample_time, clock, freq) = self.clock_est;
        (clock + (eventtime - sample_time) * freq).max(0.0) as u64
    }

    /// Estimated host time at which the MCU clock reaches `reqclock`.
    pub fn estimate_clock_systime(&self, reqclock: u64) -> f64 {
        let (sample_time, clock, freq) = self.clock_est;
        (reqclock as f64 - clock) / freq + sample_time
    }

    pub fn estimated_print_time(&self, eventtime: f64) -> f64 {
        self.clock_to_print_time(self.get_clock(eventtime))
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        (print_time * self.mcu_freq).max(0.0) as u64
    }

    pub fn clock_to_print_time(&self, clock: u64) -> f64 {
        clock as f64 / self.mcu_freq
    }

    /// Extend a 32-bit clock to the 64-bit value nearest the last sample.
    pub fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        let diff = clock32.wrapping_sub(self.last_clock as u32) as i32;
        self.last_clock.wrapping_add_signed(i64::from(diff))
    }

    /// The primary MCU defines print time, so no adjustment applies.
    pub fn calibrate_clock(&self) -> (f64, f64) {
        (0.0, self.mcu_freq)
    }

    pub fn stats(&self) -> String {
        format!("freq={}", self.clock_est.2 as i64)
    }

    pub fn dump_debug(&self) -> String {
        let (sample_time, clock, freq) = self.clock_est;
        format!(
            "clocksync state: mcu_freq={} last_clock={} clock_est=({:.3} {} {:.3}) \
             min_half_rtt={:.6} min_rtt_time={:.3} time_avg={:.3}({:.3}) \
             clock_avg={:.3}({:.3}) pred_variance={:.3}",
            self.mcu_freq as i64,
            self.last_clock,
            sample_time,
            clock as i64,
            freq,
            self.min_half_rtt,
            self.min_rtt_time,
            self.time_avg,
            self.time_variance,
            self.clock_avg,
            self.clock_covariance,
            self.prediction_variance,
        )
    }
}

/// Maps a secondary MCU's clock onto the primary's print time.
///
/// Holds `print_time = clock / freq + offset`, re-fitted by
/// [`calibrate_clock`](Self::calibrate_clock) so the two clocks agree at a
/// point a few seconds ahead.
#[derive(Debug, Clone)]
pub struct SecondarySync {
    clock_adj: (f64, f64),
    last_sync_time: f64,
}

impl SecondarySync {
    /// Align the secondary with the primary at host time `curtime`.
    pub fn connect(local: &ClockSync, main: &ClockSync, curtime: f64) -> Self {
        let mut sync = Self {
            clock_adj: (0.0, local.mcu_freq()),
            last_sync_time: 0.0,
        };
        let main_print_time = main.estimated_print_time(curtime);
        let local_print_time = sync.clock_to_print_time(local.get_clock(curtime));
        sync.clock_adj = (main_print_time - local_print_time, local.mcu_freq());
        sync.calibrate_clock(local, main, 0.0, curtime);
        sync
    }

    /// `(offset, frequency)` of the current adjustment.
    pub fn clock_adj(&self) -> (f64, f64) {
        self.clock_adj
    }

    pub fn last_sync_time(&self) -> f64 {
        self.last_sync_time
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        let (offset, freq) = self.clock_adj;
        ((print_time - offset) * freq).max(0.0) as u64
    }

    pub fn clock_to_print_time(&self, clock: u64) -> f64 {
        let (offset, freq) = self.clock_adj;
        clock as f64 / freq + offset
    }

    pub fn estimated_print_time(&self, local: &ClockSync, eventtime: f64) -> f64 {
        self.clock_to_print_time(local.get_clock(eventtime))
    }

    /// Re-fit the adjustment so it meets the primary's print time at a
    /// future sync point; returns the new `(offset, frequency)`.
    pub fn calibrate_clock(
        &mut self,
        local: &ClockSync,
        main: &ClockSync,
        print_time: f64,
        eventtime: f64,
    ) -> (f64, f64) {
        let (ser_time, ser_clock, ser_freq) = main.clock_est();
        let main_mcu_freq = main.mcu_freq();
        let est_main_clock = (eventtime - ser_time) * ser_freq + ser_clock;
        let est_print_time = est_main_clock / main_mcu_freq;

        let sync1_print_time = print_time.max(est_print_time);
        let sync2_print_time = (sync1_print_time + 4.0)
            .max(self.last_sync_time)
            .max(print_time + 2.5 * (print_time - est_print_time));

        let sync2_main_clock = sync2_print_time * main_mcu_freq;
        let sync2_sys_time = ser_time + (sync2_main_clock - ser_clock) / ser_freq;

        let sync1_clock = self.print_time_to_clock(sync1_print_time) as f64;
        let sync2_clock = local.get_clock(sync2_sys_time) as f64;
        let adjusted_freq =
            (sync2_clock - sync1_clock) / (sync2_print_time - sync1_print_time);
        let adjusted_offset = sync1_print_time - sync1_clock / adjusted_freq;

        self.clock_adj = (adjusted_offset, adjusted_freq);
        self.last_sync_time = sync2_print_time;
        self.clock_adj
    }

    pub fn stats(&self, local: &ClockSync) -> String {
        let (offset, freq) = self.clock_adj;
        format!("{} adj={}", local.stats(), format_args!("{offset:.6}/{freq:.0}"))
    }

    pub fn dump_debug(&self, local: &ClockSync) -> String {
        let (offset, freq) = self.clock_adj;
        let mut out = local.dump_debug();
        let _ = write!(out, " clock_adj=({offset:.3} {freq:.3})");
        out
    }
}
