//! Rolling hash-rate averages from target-check deltas.
//!
//! The hashcore has no direct hash-rate readout; the driver accumulates the
//! per-poll target-check deltas and closes a window every minute of wall
//! clock. One-minute figures feed bounded 10- and 60-entry queues whose
//! means give the 10- and 60-minute averages. Windows outside (10, 100)
//! MH/s are treated as flukes (core reset mid-window, counter glitch) and
//! kept out of the longer averages.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Wall-clock length of one averaging window.
const WINDOW: Duration = Duration::from_secs(60);

/// Accepted band for a 1-minute average, MH/s, both ends exclusive.
const FLUKE_LOW_MHS: f64 = 10.0;
const FLUKE_HIGH_MHS: f64 = 100.0;

/// The four published average slots: 1-minute MH/s, 10-minute MH/s,
/// 60-minute MH/s, hardware error rate in percent.
pub type AverageSlots = [f64; 4];

pub struct HashrateAverages {
    hash_counter: u64,
    window_started: Instant,
    avg_10min: VecDeque<f64>,
    avg_60min: VecDeque<f64>,
    slots: AverageSlots,
}

impl HashrateAverages {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            hash_counter: 0,
            window_started: now,
            avg_10min: VecDeque::new(),
            avg_60min: VecDeque::new(),
            slots: [0.0; 4],
        }
    }

    /// Record a target-check delta at the current time.
    pub fn record(&mut self, target_checks: u64, error_rate: f64) {
        self.record_at(Instant::now(), target_checks, error_rate);
    }

    /// Record a target-check delta at the given timestamp, closing the
    /// averaging window if a minute has elapsed.
    pub fn record_at(&mut self, now: Instant, target_checks: u64, error_rate: f64) {
        self.hash_counter += target_checks;

        if now.duration_since(self.window_started) <= WINDOW {
            return;
        }

        let avg_1min = (self.hash_counter / 60) as f64 / 1e6;
        if avg_1min > FLUKE_LOW_MHS && avg_1min < FLUKE_HIGH_MHS {
            self.avg_10min.push_back(avg_1min);
            self.avg_60min.push_back(avg_1min);
        }
        if self.avg_10min.len() > 10 {
            self.avg_10min.pop_front();
        }
        if self.avg_60min.len() > 60 {
            self.avg_60min.pop_front();
        }

        self.slots = [
            avg_1min,
            mean(&self.avg_10min),
            mean(&self.avg_60min),
            error_rate * 100.0,
        ];
        self.window_started = now;
        self.hash_counter = 0;
    }

    /// Latest published slots.
    pub fn slots(&self) -> AverageSlots {
        self.slots
    }
}

impl Default for HashrateAverages {
    fn default() -> Self {
        Self::new()
    }
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Target checks producing an `mhs` MH/s one-minute average.
    fn checks_for(mhs: f64) -> u64 {
        (mhs * 1e6) as u64 * 60
    }

    #[test]
    fn window_needs_a_full_minute() {
        let base = Instant::now();
        let mut avgs = HashrateAverages::starting_at(base);

        avgs.record_at(base + Duration::from_secs(30), checks_for(50.0), 0.0);
        assert_eq!(avgs.slots(), [0.0; 4]);
    }

    #[test]
    fn one_minute_average_published() {
        let base = Instant::now();
        let mut avgs = HashrateAverages::starting_at(base);

        avgs.record_at(base + Duration::from_secs(30), checks_for(48.0), 0.0);
        avgs.record_at(base + Duration::from_secs(61), 0, 0.015);

        let slots = avgs.slots();
        assert!((slots[0] - 48.0).abs() < 0.01);
        assert!((slots[1] - 48.0).abs() < 0.01);
        assert!((slots[2] - 48.0).abs() < 0.01);
        assert!((slots[3] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn flukes_are_kept_out_of_long_averages() {
        let base = Instant::now();
        let mut avgs = HashrateAverages::starting_at(base);

        // 5 MH/s window: below the accepted band.
        avgs.record_at(base + Duration::from_secs(61), checks_for(5.0), 0.0);
        assert!((avgs.slots()[0] - 5.0).abs() < 0.01);
        assert_eq!(avgs.slots()[1], 0.0);

        // 500 MH/s window: above the accepted band.
        avgs.record_at(base + Duration::from_secs(122), checks_for(500.0), 0.0);
        assert_eq!(avgs.slots()[1], 0.0);
        assert_eq!(avgs.slots()[2], 0.0);

        // A sane window finally lands in the queues.
        avgs.record_at(base + Duration::from_secs(183), checks_for(55.0), 0.0);
        assert!((avgs.slots()[1] - 55.0).abs() < 0.01);
    }

    #[test]
    fn ten_minute_queue_is_bounded() {
        let base = Instant::now();
        let mut avgs = HashrateAverages::starting_at(base);

        // 12 windows of increasing rate; only the last 10 may count.
        for i in 0..12u64 {
            avgs.record_at(
                base + Duration::from_secs(61 * (i + 1)),
                checks_for(20.0 + i as f64),
                0.0,
            );
        }

        // Windows 2..=11 (rates 22..31) remain: mean 26.5.
        assert!((avgs.slots()[1] - 26.5).abs() < 0.01);
        // All 12 fit the 60-entry queue: mean of 20..31 = 25.5.
        assert!((avgs.slots()[2] - 25.5).abs() < 0.01);
    }

    #[test]
    fn counter_resets_between_windows() {
        let base = Instant::now();
        let mut avgs = HashrateAverages::starting_at(base);

        avgs.record_at(base + Duration::from_secs(61), checks_for(40.0), 0.0);
        // Nothing recorded in the second window.
        avgs.record_at(base + Duration::from_secs(122), 0, 0.0);
        assert_eq!(avgs.slots()[0], 0.0);
    }
}
