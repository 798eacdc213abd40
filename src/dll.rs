//! Digital phase-locked loop rate tracker (spec component C4, §4.3).
//!
//! A two-pole smoothed estimator of `device rate / nominal rate`. Takes an
//! `(observed_error_seconds, elapsed_seconds)` sample every tick and
//! produces a new `base` (smoothed period estimate, seconds) and `dt` (rate
//! ratio, clamped to `[0.95, 1.05]` for consumers per spec invariant 5).

use std::f64::consts::PI;

/// Wide bandwidth used at start and immediately after an xrun recovery, for
/// quick lock.
pub const BW_MAX: f64 = 0.128;

/// Narrow, steady-state tracking bandwidth.
pub const BW_MIN: f64 = 0.016;

/// How long (seconds) of stable tracking at `BW_MAX` before narrowing to
/// `BW_MIN`.
pub const BW_PERIOD: f64 = 3.0;

const DT_MIN: f64 = 0.95;
const DT_MAX: f64 = 1.05;

/// The DLL's internal state (spec "DLL state" in §3).
#[derive(Debug, Clone, Copy)]
pub struct Dll {
    /// Smoothed average period, seconds.
    base: f64,
    /// Rate ratio used for pacing, clamped to `[DT_MIN, DT_MAX]`.
    dt: f64,
    /// Current loop bandwidth, Hz.
    bw: f64,
    /// Second-pole accumulator.
    z: f64,
    /// Seconds spent at the current bandwidth since the last reseed/narrow.
    time_in_band: f64,
}

impl Dll {
    /// A freshly seeded DLL: `base` is the nominal period (`1/rate`),
    /// `dt == 1.0`, bandwidth wide (`BW_MAX`). Used at engine start and
    /// after every xrun recovery (spec §4.6 step 3).
    pub fn new(nominal_period_seconds: f64) -> Self {
        Dll { base: nominal_period_seconds, dt: 1.0, bw: BW_MAX, z: 0.0, time_in_band: 0.0 }
    }

    /// Re-seed at `BW_MAX`, keeping the last known period as the new
    /// baseline rather than snapping back to the nominal rate - we already
    /// had a lock before the xrun, no sense in throwing that away.
    pub fn reseed(&mut self) {
        self.bw = BW_MAX;
        self.z = 0.0;
        self.time_in_band = 0.0;
    }

    /// Feed one `(err, elapsed)` sample (spec §4.3 formulas) and return the
    /// updated rate ratio `dt`.
    pub fn update(&mut self, err: f64, elapsed: f64) -> f64 {
        let omega = 2.0 * PI * self.bw;
        let b = 2f64.sqrt() * omega;
        let c = omega * omega;

        self.base += b * err + self.z;
        self.z += c * err;

        if elapsed > 0.0 {
            self.dt = (self.base / elapsed).clamp(DT_MIN, DT_MAX);
        }

        if self.bw > BW_MIN {
            self.time_in_band += elapsed.max(0.0);
            if self.time_in_band >= BW_PERIOD {
                self.bw = BW_MIN;
                self.time_in_band = 0.0;
            }
        }

        self.dt
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn bandwidth(&self) -> f64 {
        self.bw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dt_starts_at_one() {
        let d = Dll::new(1024.0 / 48000.0);
        assert_eq!(d.dt(), 1.0);
    }

    #[test]
    fn dt_stays_clamped_under_large_error() {
        let mut d = Dll::new(1024.0 / 48000.0);
        let dt = d.update(10.0, 1024.0 / 48000.0);
        assert!((DT_MIN..=DT_MAX).contains(&dt));
    }

    #[test]
    fn reseed_resets_bandwidth_to_max() {
        let mut d = Dll::new(1024.0 / 48000.0);
        d.bw = BW_MIN;
        d.reseed();
        assert_eq!(d.bandwidth(), BW_MAX);
    }

    #[test]
    fn bandwidth_narrows_after_bw_period_of_stable_tracking() {
        let period = 1024.0 / 48000.0;
        let mut d = Dll::new(period);
        let mut t = 0.0;
        while t < BW_PERIOD + period {
            d.update(0.0, period);
            t += period;
        }
        assert_eq!(d.bandwidth(), BW_MIN);
    }

    #[test]
    fn converges_to_unity_rate_ratio_with_zero_error() {
        let period = 1024.0 / 48000.0;
        let mut d = Dll::new(period);
        let mut dt = 1.0;
        for _ in 0..2000 {
            dt = d.update(0.0, period);
        }
        assert!((dt - 1.0).abs() < 0.005);
    }
}
