// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Learned per-level compensation for the package-wide clamp.
//!
//! Platforms differ in how readily the package drops into deep C-states, so
//! injecting N% idle rarely yields N% package residency. Every clean window
//! (achieved ratio slightly below target, no wakeup storm) teaches the table
//! how many extra points the level needs. Once a level and its neighbours
//! have seen enough clean windows the learned offset is applied.
//!
//! Only the control CPU writes to the table, any CPU may read it.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use serde::Serialize;

/// Number of clean windows after which an entry is trusted and frozen.
pub const CONFIDENCE_OK: u32 = 3;

#[derive(Default)]
struct CalibrationEntry {
    confidence: AtomicU32,
    steady_comp: AtomicU32,
}

/// One row of the calibration dump.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CalibrationRow {
    pub level: u32,
    pub confidence: u32,
    pub steady_comp: u32,
}

/// Outcome of feeding one window result to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// The level is already trusted, nothing learned.
    Frozen,
    /// The sample was clean and folded into the level's compensation.
    Clean { delta: u32 },
    /// The sample was outside the acceptable band and dropped.
    Discarded { delta: i64 },
}

pub struct CalibrationTable {
    entries: Vec<CalibrationEntry>,
}

/// Upper bound of the clean band for `level`. It widens with the level to
/// tolerate proportionally more noise.
pub fn clean_band(level: u32) -> u32 {
    1 + level / 10
}

impl CalibrationTable {
    /// A table for levels `0..nr_levels`.
    pub fn new(nr_levels: usize) -> Self {
        Self {
            entries: (0..nr_levels).map(|_| CalibrationEntry::default()).collect(),
        }
    }

    pub fn nr_levels(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn confidence(&self, level: u32) -> u32 {
        self.entries
            .get(level as usize)
            .map_or(0, |e| e.confidence.load(Ordering::Acquire))
    }

    pub fn steady_comp(&self, level: u32) -> u32 {
        self.entries
            .get(level as usize)
            .map_or(0, |e| e.steady_comp.load(Ordering::Acquire))
    }

    fn trusted(&self, level: u32) -> bool {
        self.confidence(level) >= CONFIDENCE_OK
    }

    /// Learn from a window run at `level` where `requested` was the target
    /// at the time of the measurement and `achieved` the measured ratio.
    pub fn adjust(&self, level: u32, requested: u32, achieved: u32) -> Adjustment {
        let Some(entry) = self.entries.get(level as usize) else {
            return Adjustment::Frozen;
        };
        if entry.confidence.load(Ordering::Acquire) >= CONFIDENCE_OK {
            return Adjustment::Frozen;
        }

        let delta = requested as i64 - achieved as i64;
        if delta < 0 || delta > clean_band(level) as i64 {
            return Adjustment::Discarded { delta };
        }
        let delta = delta as u32;

        let prev = entry.steady_comp.load(Ordering::Acquire);
        let comp = if prev != 0 {
            (delta + prev).div_ceil(2)
        } else {
            delta
        };
        entry.steady_comp.store(comp, Ordering::Release);
        entry.confidence.fetch_add(1, Ordering::AcqRel);

        Adjustment::Clean { delta }
    }

    /// Extra points to add to `level`. Non-zero only when the level and the
    /// two levels around it are all trusted. The lowest and highest levels
    /// borrow both neighbours from the side that exists.
    pub fn compensation(&self, level: u32) -> u32 {
        let nr = self.nr_levels();
        if level == 0 || level >= nr || nr < 4 {
            return 0;
        }

        let window = if level == 1 {
            [1, 2, 3]
        } else if level == nr - 1 {
            [level, level - 1, level - 2]
        } else {
            [level - 1, level, level + 1]
        };

        if !window.iter().all(|l| self.trusted(*l)) {
            return 0;
        }

        let comp = window.iter().map(|l| self.steady_comp(*l)).sum::<u32>() / 3;

        // Do not push the level past the table.
        if comp + level >= nr {
            nr - level - 1
        } else {
            comp
        }
    }

    /// `level` plus its learned compensation, never below 1.
    pub fn compensated_level(&self, level: u32) -> u32 {
        (level + self.compensation(level)).max(1)
    }

    pub fn rows(&self) -> Vec<CalibrationRow> {
        (0..self.nr_levels())
            .map(|level| CalibrationRow {
                level,
                confidence: self.confidence(level),
                steady_comp: self.steady_comp(level),
            })
            .collect()
    }
}
