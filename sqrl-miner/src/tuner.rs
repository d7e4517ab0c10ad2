//! Auto-tuner surface.
//!
//! The tuning search itself (stepping clocks, scoring error rates, writing
//! tune files) lives outside the driver. This module carries the state the
//! driver interacts with: the intensity triple a tune may impose on the
//! search loop, the tuning stage and hardware error rate shown in
//! telemetry, and lookup of a previously saved tune record keyed by the
//! board's setting ID.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Core flag fields a tune run settles on. All three are applied together
/// so the search loop always sees a consistent triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntensitySettings {
    pub patience: u8,
    pub intensity_n: u8,
    pub intensity_d: u8,
}

/// One saved tune: the intensity triple plus the clock it was tuned at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneRecord {
    pub intensity: IntensitySettings,
    pub clock_mhz: u32,
}

/// Per-device tuner state.
pub struct Tuner {
    /// Auto-tune mode from settings; 0 disables the search.
    mode: Mutex<u32>,
    /// Stage of the running search; 0 when idle/complete.
    stage: AtomicU8,
    /// Target-check samples observed since the last stage change.
    samples: AtomicU64,
    applied: Mutex<Option<IntensitySettings>>,
    error_rate: Mutex<f64>,
}

impl Tuner {
    pub fn new(mode: u32) -> Self {
        Self {
            mode: Mutex::new(mode),
            stage: AtomicU8::new(0),
            samples: AtomicU64::new(0),
            applied: Mutex::new(None),
            error_rate: Mutex::new(0.0),
        }
    }

    /// Look up the record for `setting_id` in a tune file. Lines are
    /// whitespace-separated `settingID patience intensityN intensityD clock`;
    /// lines for other boards or with malformed fields are skipped.
    pub fn load_saved_tune(path: &Path, setting_id: &str) -> io::Result<Option<TuneRecord>> {
        let contents = std::fs::read_to_string(path)?;
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some(setting_id) {
                continue;
            }
            let parsed = (|| {
                Some(TuneRecord {
                    intensity: IntensitySettings {
                        patience: fields.next()?.parse().ok()?,
                        intensity_n: fields.next()?.parse().ok()?,
                        intensity_d: fields.next()?.parse().ok()?,
                    },
                    clock_mhz: fields.next()?.parse().ok()?,
                })
            })();
            match parsed {
                Some(record) => return Ok(Some(record)),
                None => warn!(setting_id, "malformed tune record, ignoring"),
            }
        }
        Ok(None)
    }

    /// Adopt a saved tune and disable further searching.
    pub fn apply_saved(&self, record: TuneRecord) {
        info!(
            patience = record.intensity.patience,
            intensity_n = record.intensity.intensity_n,
            intensity_d = record.intensity.intensity_d,
            clock = record.clock_mhz,
            "applying saved tune"
        );
        *self.applied.lock() = Some(record.intensity);
        *self.mode.lock() = 0;
    }

    /// Called by the epoch initializer once the DAG is staged and the core
    /// clock restored; a tuning search may begin from here.
    pub fn start(&self, clock_mhz: u32) {
        if *self.mode.lock() == 0 {
            return;
        }
        debug!(clock_mhz, "tuner armed");
        self.samples.store(0, Ordering::Relaxed);
        self.stage.store(1, Ordering::Relaxed);
    }

    /// Per-poll hook from the search loop with the target-check delta.
    /// Polls where the core made no progress carry no information for the
    /// policy and are not counted.
    pub fn observe(&self, target_checks: u64) {
        if target_checks > 0 {
            self.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Productive polls observed since the current stage began. The tuning
    /// policy scores a stage once enough of these have accumulated, and the
    /// status line shows the count while a search is in progress.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// The intensity triple the search loop should run with, if a tune has
    /// been applied.
    pub fn intensity(&self) -> Option<IntensitySettings> {
        *self.applied.lock()
    }

    /// Fraction of hardware-invalid results observed by the tuning policy.
    pub fn hardware_error_rate(&self) -> f64 {
        *self.error_rate.lock()
    }

    /// Current tuning stage; nonzero means a search is in progress.
    pub fn stage(&self) -> u8 {
        self.stage.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tune_file(tag: &str, contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("sqrl-tune-test-{}-{}", std::process::id(), tag));
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(contents.as_bytes()).expect("write");
        path
    }

    #[test]
    fn finds_matching_record() {
        let path = tune_file(
            "match",
            "aaaa_1111_850.00920.00 4 10 8 500\n\
             bbbb_2222_850.00920.00 6 12 8 520\n",
        );
        let record = Tuner::load_saved_tune(&path, "bbbb_2222_850.00920.00")
            .expect("read")
            .expect("record");
        assert_eq!(
            record,
            TuneRecord {
                intensity: IntensitySettings {
                    patience: 6,
                    intensity_n: 12,
                    intensity_d: 8,
                },
                clock_mhz: 520,
            }
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn skips_unknown_and_malformed_lines() {
        let path = tune_file(
            "malformed",
            "cccc_3333_000.00000.00 4 10 8 500\n\
             dddd_4444_000.00000.00 not numbers\n",
        );
        assert!(Tuner::load_saved_tune(&path, "eeee_5555")
            .expect("read")
            .is_none());
        assert!(Tuner::load_saved_tune(&path, "dddd_4444_000.00000.00")
            .expect("read")
            .is_none());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn applied_tune_overrides_and_disables_search() {
        let tuner = Tuner::new(1);
        assert!(tuner.intensity().is_none());

        tuner.apply_saved(TuneRecord {
            intensity: IntensitySettings {
                patience: 5,
                intensity_n: 20,
                intensity_d: 8,
            },
            clock_mhz: 510,
        });
        assert_eq!(
            tuner.intensity(),
            Some(IntensitySettings {
                patience: 5,
                intensity_n: 20,
                intensity_d: 8,
            })
        );

        // Search disabled: starting does not enter a stage.
        tuner.start(510);
        assert_eq!(tuner.stage(), 0);
    }

    #[test]
    fn start_arms_a_stage_when_enabled() {
        let tuner = Tuner::new(2);
        tuner.start(500);
        assert_eq!(tuner.stage(), 1);
    }

    #[test]
    fn only_productive_polls_count_as_samples() {
        let tuner = Tuner::new(1);
        tuner.start(500);

        tuner.observe(0);
        tuner.observe(12_000_000);
        tuner.observe(0);
        tuner.observe(11_500_000);
        assert_eq!(tuner.samples(), 2);

        // A new stage starts its count over.
        tuner.start(510);
        assert_eq!(tuner.samples(), 0);
    }
}
