use std::sync::OnceLock;
use std::time::Instant;

/// Timer value meaning "run immediately".
pub const NOW: f64 = 0.0;
/// Timer value meaning "not scheduled".
pub const NEVER: f64 = f64::INFINITY;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds on a process-wide monotonic clock.
///
/// All host timestamps in mculink (send/receive times, clock-sync samples,
/// print-time estimates) use this clock, so they are directly comparable.
pub fn monotonic() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64() + 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances_and_is_positive() {
        let a = monotonic();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic();
        assert!(a >= 1.0);
        assert!(b > a);
    }
}
