/// Linear mapping between host time and MCU clock, pushed by clock sync.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockEstimate {
    /// Estimated MCU ticks per host second; `0.0` until synchronized.
    pub est_freq: f64,
    /// Host time of the conversion reference point.
    pub conv_time: f64,
    /// MCU clock at `conv_time`.
    pub conv_clock: u64,
    /// Most recent MCU clock reported.
    pub last_clock: u64,
}

impl ClockEstimate {
    pub fn new(est_freq: f64, conv_time: f64, conv_clock: u64, last_clock: u64) -> Self {
        Self {
            est_freq,
            conv_time,
            conv_clock,
            last_clock,
        }
    }

    /// MCU clock expected at host time `time`.
    pub fn clock_from_time(&self, time: f64) -> u64 {
        let delta = ((time - self.conv_time) * self.est_freq + 0.5).floor() as i64;
        if delta < 0 {
            self.conv_clock.saturating_sub(delta.unsigned_abs())
        } else {
            self.conv_clock.saturating_add(delta as u64)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.est_freq > 0.0
    }
}
