//! Derived transfer state: instantaneous rate, windowed average rate,
//! percentage, and the min/max/mean/deviation statistics.
//!
//! The average rate comes from a bounded ring of (elapsed, total-written)
//! samples rather than a decaying average, so a stall shows up in the ETA
//! within one history window instead of lingering.

/// One history sample: where the transfer was at a given elapsed time.
#[derive(Debug, Clone, Copy, Default)]
struct HistorySample {
    elapsed_sec: f64,
    total_written: u64,
}

#[derive(Debug)]
pub struct CalcState {
    prev_elapsed_sec: f64,
    prev_rate: f64,
    prev_trans: f64,
    prev_total_written: u64,
    history: Vec<HistorySample>,
    history_first: usize,
    history_last: usize,
    history_interval: f64,
    /// Windowed average rate, used for the ETA and `%a`.
    pub current_avg_rate: f64,
    /// Instantaneous rate as of the last update.
    pub transfer_rate: f64,
    /// Average rate as of the last update (whole-transfer average on the
    /// final update).
    pub average_rate: f64,
    /// Percentage ×1; [0, 100000] when the size is known, a 0..200 sweep
    /// otherwise.
    pub percentage: i64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub rate_sum: f64,
    pub ratesquared_sum: f64,
    pub measurements_taken: u64,
}

impl CalcState {
    /// Create a calculator with an averaging window of `window` seconds.
    ///
    /// Short windows keep one sample per second; longer windows keep one
    /// sample per five seconds so the ring stays small.
    pub fn new(window: u32) -> CalcState {
        let window = window.max(1);
        let (len, interval) = if window < 20 {
            (window as usize + 1, 1.0)
        } else {
            (window as usize / 5 + 1, 5.0)
        };
        CalcState {
            prev_elapsed_sec: 0.0,
            prev_rate: 0.0,
            prev_trans: 0.0,
            prev_total_written: 0,
            history: vec![HistorySample::default(); len],
            history_first: 0,
            history_last: 0,
            history_interval: interval,
            current_avg_rate: 0.0,
            transfer_rate: 0.0,
            average_rate: 0.0,
            percentage: 0,
            rate_min: 0.0,
            rate_max: 0.0,
            rate_sum: 0.0,
            ratesquared_sum: 0.0,
            measurements_taken: 0,
        }
    }

    /// Append to the history ring if a full history interval has elapsed,
    /// then recompute the windowed average rate.
    fn update_average_rate_history(&mut self, elapsed_sec: f64, total_written: u64, rate: f64) {
        let len = self.history.len();
        let last_elapsed = self.history[self.history_last].elapsed_sec;

        // Not the first sample, and not yet time for another one.
        if last_elapsed > 0.0 && elapsed_sec < last_elapsed + self.history_interval {
            return;
        }

        if last_elapsed > 0.0 {
            self.history_last = (self.history_last + 1) % len;
            if self.history_last == self.history_first {
                self.history_first = (self.history_first + 1) % len;
            }
        }

        self.history[self.history_last] = HistorySample {
            elapsed_sec,
            total_written,
        };

        if self.history_first == self.history_last {
            self.current_avg_rate = rate;
        } else {
            let first = self.history[self.history_first];
            let last = self.history[self.history_last];
            let span = last.elapsed_sec - first.elapsed_sec;
            if span > 0.0 {
                self.current_avg_rate =
                    (last.total_written as f64 - first.total_written as f64) / span;
            }
        }
    }

    /// Update every derived figure for one display tick.
    ///
    /// With `final_update` set, the rate and average are recomputed over
    /// the whole transfer, which is what the last painted line shows.
    pub fn update(
        &mut self,
        total_written: u64,
        mut elapsed_sec: f64,
        initial_offset: u64,
        size: u64,
        bits: bool,
        final_update: bool,
    ) {
        let bytes_since_last = total_written.saturating_sub(self.prev_total_written) as f64;
        self.prev_total_written = total_written;

        // Guard against rate spikes and division by zero when two updates
        // land closer together than the clock can meaningfully resolve:
        // accumulate the transfer and reuse the previous rate.
        let time_since_last = elapsed_sec - self.prev_elapsed_sec;
        let mut rate;
        if time_since_last <= 0.01 {
            rate = self.prev_rate;
            self.prev_trans += bytes_since_last;
        } else {
            rate = (bytes_since_last + self.prev_trans) / time_since_last;
            self.prev_elapsed_sec = elapsed_sec;
            self.prev_trans = 0.0;

            let measured = if bits { rate * 8.0 } else { rate };
            if self.measurements_taken < 1 || measured < self.rate_min {
                self.rate_min = measured;
            }
            if measured > self.rate_max {
                self.rate_max = measured;
            }
            self.rate_sum += measured;
            self.ratesquared_sum += measured * measured;
            self.measurements_taken += 1;
        }
        self.prev_rate = rate;

        self.update_average_rate_history(elapsed_sec, total_written, rate);
        let mut average_rate = self.current_avg_rate;

        if final_update {
            if elapsed_sec < 0.000_001 {
                elapsed_sec = 0.000_001;
            }
            average_rate = (total_written as f64 - initial_offset as f64) / elapsed_sec;
            rate = average_rate;
        }

        self.transfer_rate = rate;
        self.average_rate = average_rate;

        if size == 0 {
            // Unknown total: sweep 0..200 so numeric output cycles
            // 0-100-0 and the oscillating bar moves back and forth.
            if rate > 0.0 {
                self.percentage += 2;
            }
            if self.percentage > 199 {
                self.percentage = 0;
            }
        } else {
            self.percentage = (total_written as i64).saturating_mul(100) / size as i64;
        }
        self.percentage = self.percentage.clamp(0, 100_000);
    }

    /// Mean of the recorded per-tick rates.
    pub fn rate_mean(&self) -> f64 {
        if self.measurements_taken == 0 {
            return 0.0;
        }
        self.rate_sum / self.measurements_taken as f64
    }

    /// Population standard deviation of the recorded per-tick rates.
    pub fn rate_deviation(&self) -> f64 {
        if self.measurements_taken == 0 {
            return 0.0;
        }
        let mean = self.rate_mean();
        let variance = self.ratesquared_sum / self.measurements_taken as f64 - mean * mean;
        variance.max(0.0).sqrt()
    }
}

/// Estimated seconds until completion, clamped to [0, 100,000 hours].
pub fn seconds_remaining(so_far: u64, total: u64, rate: f64) -> i64 {
    if so_far < 1 || rate <= 0.0 {
        return 0;
    }
    let left = (total.saturating_sub(so_far)) as f64 / rate;
    (left as i64).clamp(0, 360_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate_is_measured() {
        let mut calc = CalcState::new(30);
        for tick in 1..=10u64 {
            calc.update(tick * 1000, tick as f64, 0, 0, false, false);
        }
        assert!((calc.transfer_rate - 1000.0).abs() < 1.0);
        assert!((calc.current_avg_rate - 1000.0).abs() < 1.0);
    }

    #[test]
    fn sub_centisecond_updates_reuse_previous_rate() {
        let mut calc = CalcState::new(30);
        calc.update(1000, 1.0, 0, 0, false, false);
        let rate = calc.transfer_rate;
        calc.update(2000, 1.001, 0, 0, false, false);
        assert!((calc.transfer_rate - rate).abs() < f64::EPSILON);
        // The deferred bytes surface once enough time has passed.
        calc.update(2000, 2.0, 0, 0, false, false);
        assert!(calc.transfer_rate > rate * 0.9);
    }

    #[test]
    fn history_ring_wraps_without_growing() {
        let mut calc = CalcState::new(5);
        let capacity = calc.history.len();
        for tick in 1..=50u64 {
            calc.update(tick * 100, tick as f64, 0, 0, false, false);
        }
        assert_eq!(calc.history.len(), capacity);
        // Average over the last window only, not the whole run.
        assert!((calc.current_avg_rate - 100.0).abs() < 5.0);
    }

    #[test]
    fn known_size_gives_percentage() {
        let mut calc = CalcState::new(30);
        calc.update(500, 1.0, 0, 1000, false, false);
        assert_eq!(calc.percentage, 50);
        calc.update(2000, 2.0, 0, 1000, false, false);
        assert_eq!(calc.percentage, 200);
    }

    #[test]
    fn unknown_size_sweeps_percentage() {
        let mut calc = CalcState::new(30);
        let mut seen_reset = false;
        let mut previous = 0;
        for tick in 1..=120u64 {
            calc.update(tick * 10, tick as f64, 0, 0, false, false);
            if calc.percentage < previous {
                seen_reset = true;
            }
            assert!(calc.percentage <= 199);
            previous = calc.percentage;
        }
        assert!(seen_reset);
    }

    #[test]
    fn final_update_averages_whole_transfer() {
        let mut calc = CalcState::new(30);
        calc.update(1000, 1.0, 0, 0, false, false);
        calc.update(10_000, 10.0, 0, 0, false, true);
        assert!((calc.transfer_rate - 1000.0).abs() < 1.0);
        assert!((calc.average_rate - 1000.0).abs() < 1.0);
    }

    #[test]
    fn statistics_track_extremes() {
        let mut calc = CalcState::new(30);
        calc.update(100, 1.0, 0, 0, false, false);
        calc.update(1100, 2.0, 0, 0, false, false);
        calc.update(1200, 3.0, 0, 0, false, false);
        assert!(calc.rate_min <= 100.0);
        assert!(calc.rate_max >= 1000.0);
        assert!(calc.rate_mean() > 0.0);
        assert!(calc.rate_deviation() >= 0.0);
        assert_eq!(calc.measurements_taken, 3);
    }

    #[test]
    fn eta_is_clamped_and_guarded() {
        assert_eq!(seconds_remaining(0, 100, 10.0), 0);
        assert_eq!(seconds_remaining(50, 100, 0.0), 0);
        assert_eq!(seconds_remaining(50, 100, 10.0), 5);
        assert_eq!(seconds_remaining(1, u64::MAX, 0.0001), 360_000_000);
    }
}
