//! Output level metering.
//!
//! The audio thread low-passes the squared mono sum of the bus and posts the
//! filtered power a few dozen times per second. The main thread turns those
//! posts into decibels and keeps a peak-hold over the last second.

use std::collections::VecDeque;

/// Floor for levels of digital silence.
pub const MIN_DB: f32 = -200.0;

const GROUP: usize = 8;

/// Level as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputLevel {
    /// Most recent level
    pub db: f32,
    /// Highest level within the hold window
    pub peak_db: f32,
}

impl Default for OutputLevel {
    fn default() -> Self {
        Self {
            db: MIN_DB,
            peak_db: MIN_DB,
        }
    }
}

pub fn power_to_db(power: f32) -> f32 {
    if power > 0.0 {
        (10.0 * power.log10()).max(MIN_DB)
    } else {
        MIN_DB
    }
}

/// One-pole smoother over `(left + right)²`, run on the audio thread.
#[derive(Debug)]
pub(crate) struct LevelFilter {
    state: f32,
    since_update: usize,
    update_interval: usize,
}

impl LevelFilter {
    pub(crate) fn new(update_interval: usize) -> Self {
        Self {
            state: 0.0,
            since_update: 0,
            update_interval: update_interval.max(1),
        }
    }

    /// Filter one block with coefficient `a`. Returns the current power when
    /// an update is due.
    ///
    /// Both channels are processed in groups of eight; the block length is a
    /// multiple of eight.
    pub(crate) fn process(&mut self, left: &[f32], right: &[f32], a: f32) -> Option<f32> {
        let gain = 1.0 - a;
        let mut y = self.state;
        for (l, r) in left.chunks_exact(GROUP).zip(right.chunks_exact(GROUP)) {
            let mut group = [0.0f32; GROUP];
            for ((g, l), r) in group.iter_mut().zip(l).zip(r) {
                let x = l + r;
                *g = x * x;
            }
            for x2 in group {
                y = gain * x2 + a * y;
            }
        }
        // keep the recursion out of the subnormal range
        if y < 1e-30 {
            y = 0.0;
        }
        self.state = y;

        self.since_update += left.len();
        if self.since_update >= self.update_interval {
            self.since_update %= self.update_interval;
            Some(y)
        } else {
            None
        }
    }
}

/// Decibel conversion and peak-hold, run on the main thread.
#[derive(Debug)]
pub(crate) struct OutputMeter {
    history: VecDeque<f32>,
    window: usize,
    peak_age: usize,
    level: OutputLevel,
}

impl OutputMeter {
    /// `window` is the hold time in updates.
    pub(crate) fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            history: VecDeque::with_capacity(window),
            window,
            peak_age: 0,
            level: OutputLevel::default(),
        }
    }

    pub(crate) fn update(&mut self, power: f32) -> OutputLevel {
        let db = power_to_db(power);
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(db);
        self.peak_age += 1;

        if db >= self.level.peak_db {
            self.level.peak_db = db;
            self.peak_age = 0;
        } else if self.peak_age >= self.window {
            // The held peak left the window; fall back to the loudest retained.
            let (newest_first, peak) = self
                .history
                .iter()
                .rev()
                .copied()
                .enumerate()
                .fold((0, MIN_DB), |best, (age, db)| if db > best.1 { (age, db) } else { best });
            self.level.peak_db = peak;
            self.peak_age = newest_first;
        }
        self.level.db = db;
        self.level
    }

    pub(crate) fn level(&self) -> OutputLevel {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn filter_converges_to_the_squared_sum() {
        let mut filter = LevelFilter::new(usize::MAX);
        let left = [0.25f32; 64];
        let right = [0.25f32; 64];
        for _ in 0..100 {
            filter.process(&left, &right, 0.5);
        }
        assert_relative_eq!(filter.state, 0.25, max_relative = 1e-5);
    }

    #[test]
    fn zero_coefficient_tracks_the_last_sample() {
        let mut filter = LevelFilter::new(8);
        let mut left = [0.0f32; 8];
        left[7] = 0.5;
        assert_eq!(filter.process(&left, &[0.0; 8], 0.0), Some(0.25));
    }

    #[test]
    fn updates_follow_the_interval() {
        let mut filter = LevelFilter::new(1600);
        let block = [0.0f32; 512];
        let updates = (0..30)
            .filter(|_| filter.process(&block, &block, 0.9).is_some())
            .count();
        // 30 * 512 samples = 15360 = 9 * 1600 + 960
        assert_eq!(updates, 9);
    }

    #[test]
    fn decibels_are_floored() {
        assert_eq!(power_to_db(0.0), MIN_DB);
        assert_eq!(power_to_db(1e-30), MIN_DB);
        assert_relative_eq!(power_to_db(1.0), 0.0);
        assert_relative_eq!(power_to_db(0.1), -10.0, max_relative = 1e-5);
    }

    #[test]
    fn peak_holds_for_the_window_then_decays() {
        let mut meter = OutputMeter::new(30);
        let loud = meter.update(1.0);
        assert_eq!(loud.peak_db, 0.0);

        for _ in 0..29 {
            let level = meter.update(0.0);
            assert_eq!(level.db, MIN_DB);
            assert_eq!(level.peak_db, 0.0);
        }

        let level = meter.update(0.0);
        assert_eq!(level.peak_db, MIN_DB);
    }

    #[test]
    fn peak_falls_back_to_the_loudest_retained_level() {
        let mut meter = OutputMeter::new(4);
        meter.update(1.0); // 0 dB
        meter.update(0.1); // -10 dB
        meter.update(0.01); // -20 dB
        meter.update(0.001);
        let level = meter.update(0.001);
        assert_relative_eq!(level.peak_db, -10.0, max_relative = 1e-5);

        // -10 dB leaves the four-update window with the next update.
        assert_relative_eq!(meter.update(0.001).peak_db, -20.0, max_relative = 1e-5);
        assert_relative_eq!(meter.level().db, -30.0, max_relative = 1e-5);
    }
}
