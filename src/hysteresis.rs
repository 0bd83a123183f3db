// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Two-state corrector used by the per-CPU cooling devices.

use crate::duty_cycle::runtime;

/// How far, in percentage points, the effective idle ratio may fall below
/// the target before the corrector kicks in.
pub const IDLE_ERROR_HYSTERESIS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Leave the programmed duration alone.
    Keep,
    /// Reprogram with a run duration derived from the effective ratio.
    Compensate { run_us: u32 },
    /// Back within the margin, reprogram the nominal duration.
    Restore,
}

#[derive(Debug, Clone, Copy)]
pub struct Hysteresis {
    margin: u32,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self::new(IDLE_ERROR_HYSTERESIS)
    }
}

impl Hysteresis {
    pub fn new(margin: u32) -> Self {
        Self { margin }
    }

    pub fn margin(&self) -> u32 {
        self.margin
    }

    /// Decide what to program for the next period given the requested
    /// `target`, the `effective` idle percentage measured over the last one
    /// and whether compensation is currently in effect.
    pub fn evaluate(
        &self,
        target: u32,
        effective: u32,
        comp_active: bool,
        idle_us: u32,
    ) -> Correction {
        if target.saturating_sub(self.margin) > effective {
            // A zero effective ratio would map to "no injection".
            Correction::Compensate {
                run_us: runtime(idle_us, effective.max(1)),
            }
        } else if comp_active {
            Correction::Restore
        } else {
            Correction::Keep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_leave() {
        let h = Hysteresis::default();
        let nominal = runtime(24000, 60);

        let c = h.evaluate(60, 50, false, 24000);
        match c {
            Correction::Compensate { run_us } => {
                assert_eq!(run_us, runtime(24000, 50));
                assert!(run_us > nominal);
            }
            _ => panic!("expected compensation, got {:?}", c),
        }

        assert_eq!(h.evaluate(60, 58, true, 24000), Correction::Restore);
        assert_eq!(h.evaluate(60, 58, false, 24000), Correction::Keep);
    }

    #[test]
    fn test_margin_boundary() {
        let h = Hysteresis::default();
        assert_eq!(h.evaluate(60, 55, false, 24000), Correction::Keep);
        assert!(matches!(
            h.evaluate(60, 54, false, 24000),
            Correction::Compensate { .. }
        ));
    }

    #[test]
    fn test_zero_effective_ratio() {
        let h = Hysteresis::default();
        assert_eq!(h.evaluate(3, 0, false, 24000), Correction::Keep);
        assert_eq!(
            h.evaluate(10, 0, false, 24000),
            Correction::Compensate {
                run_us: runtime(24000, 1)
            }
        );
    }
}
