// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Conversion from a requested idle percentage to the run duration which
//! separates two injected idle windows.

/// Highest level accepted by `runtime()`. Anything above is clamped.
pub const MAX_DUTY_LEVEL: u32 = 99;

/// Run duration in microseconds which, combined with an idle window of
/// `idle_us`, yields `level` percent of idle time.
///
/// Level 0 means "no injection" and returns 0.
pub fn runtime(idle_us: u32, level: u32) -> u32 {
    if level == 0 {
        return 0;
    }
    let level = level.min(MAX_DUTY_LEVEL) as u64;
    let idle = idle_us as u64;

    let run = (idle * 100 / level).saturating_sub(idle);
    run.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_disabled() {
        assert_eq!(runtime(24000, 0), 0);
    }

    #[test]
    fn test_known_values() {
        assert_eq!(runtime(24000, 50), 24000);
        assert_eq!(runtime(24000, 25), 72000);
        assert_eq!(runtime(24000, 1), 2_376_000);
        assert_eq!(runtime(6000, 99), 60);
    }

    #[test]
    fn test_clamped_above_99() {
        assert_eq!(runtime(24000, 100), runtime(24000, 99));
        assert_eq!(runtime(24000, 250), runtime(24000, 99));
    }

    #[test]
    fn test_non_increasing() {
        for period in [6000, 12345, 24000, 25000] {
            let mut prev = u32::MAX;
            for level in 1..100 {
                let run = runtime(period, level);
                assert!(run <= prev, "period {} level {}", period, level);
                prev = run;
            }
        }
    }
}
