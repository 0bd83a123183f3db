// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;

use crate::counters::CounterId;

/// Failure kinds surfaced by the cooling devices.
///
/// Everything in this crate returns `anyhow::Result`. When a caller needs to
/// react to a specific kind it can recover it with
/// `err.downcast_ref::<CoolingError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoolingError {
    /// Idle injection for one of the requested CPUs is already owned by
    /// another consumer.
    AlreadyClaimed { cpu: usize },
    /// The counters or instructions needed for idle injection are missing.
    UnsupportedHardware(String),
    /// A tunable was set outside of its accepted bounds.
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    /// A hardware counter could not be read this time around.
    CounterUnreadable { cpu: usize, counter: CounterId },
}

impl fmt::Display for CoolingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoolingError::AlreadyClaimed { cpu } => {
                write!(f, "idle injection already claimed on cpu {}", cpu)
            }
            CoolingError::UnsupportedHardware(why) => write!(f, "unsupported hardware: {}", why),
            CoolingError::OutOfRange {
                name,
                value,
                min,
                max,
            } => write!(
                f,
                "{} = {} is out of range, expected {}..={}",
                name, value, min, max
            ),
            CoolingError::CounterUnreadable { cpu, counter } => {
                write!(f, "failed to read {} on cpu {}", counter, cpu)
            }
        }
    }
}

impl std::error::Error for CoolingError {}

/// Returns the `CoolingError` carried by `err`, if any.
pub fn cooling_error(err: &anyhow::Error) -> Option<&CoolingError> {
    err.downcast_ref::<CoolingError>()
}
