// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime tunables shared by the cooling devices.
//!
//! Values are read from injection callbacks on arbitrary CPUs, so they are
//! kept in atomics. Setters validate and leave the previous value in place
//! when the new one is rejected.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use anyhow::Result;
use log::info;
use serde::Serialize;

use crate::CoolingError;

pub const MIN_IDLE_DURATION_US: u32 = 6000;
pub const MAX_IDLE_DURATION_US: u32 = 25000;
/// Six 4ms ticks.
pub const DEFAULT_IDLE_DURATION_US: u32 = 24000;

pub const MIN_WINDOW_SIZE: u32 = 2;
pub const MAX_WINDOW_SIZE: u32 = 10;
pub const DEFAULT_WINDOW_SIZE: u32 = 2;

/// No wakeup latency constraint.
pub const DEFAULT_IDLE_LATENCY_US: u32 = u32::MAX;

/// Run duration programmed at registration, before the first real one is
/// computed.
pub const TICK_USEC: u32 = 4000;

#[derive(Debug)]
pub struct Tunables {
    idle_duration_us: AtomicU32,
    window_size: AtomicU32,
    idle_latency_us: AtomicU32,
}

/// Plain copy of the tunables, for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TunablesSnapshot {
    pub idle_duration_us: u32,
    pub window_size: u32,
    pub idle_latency_us: u32,
}

fn check_range(name: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(CoolingError::OutOfRange {
            name,
            value: value as u64,
            min: min as u64,
            max: max as u64,
        }
        .into());
    }
    Ok(())
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            idle_duration_us: AtomicU32::new(DEFAULT_IDLE_DURATION_US),
            window_size: AtomicU32::new(DEFAULT_WINDOW_SIZE),
            idle_latency_us: AtomicU32::new(DEFAULT_IDLE_LATENCY_US),
        }
    }
}

impl Tunables {
    pub fn new(idle_duration_us: u32, window_size: u32, idle_latency_us: u32) -> Result<Self> {
        let tunables = Self::default();
        tunables.set_idle_duration_us(idle_duration_us)?;
        tunables.set_window_size(window_size)?;
        tunables.set_idle_latency_us(idle_latency_us);
        Ok(tunables)
    }

    /// Length of each injected idle window in microseconds.
    pub fn idle_duration_us(&self) -> u32 {
        self.idle_duration_us.load(Ordering::Acquire)
    }

    pub fn set_idle_duration_us(&self, value: u32) -> Result<()> {
        check_range(
            "idle_duration_us",
            value,
            MIN_IDLE_DURATION_US,
            MAX_IDLE_DURATION_US,
        )?;
        self.idle_duration_us.store(value, Ordering::Release);
        info!("idle duration set to {}us", value);
        Ok(())
    }

    /// Number of injection periods between two calibration updates.
    pub fn window_size(&self) -> u32 {
        self.window_size.load(Ordering::Acquire)
    }

    pub fn set_window_size(&self, value: u32) -> Result<()> {
        check_range("window_size", value, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)?;
        self.window_size.store(value, Ordering::Release);
        info!("calibration window set to {} periods", value);
        Ok(())
    }

    /// Maximum wakeup latency allowed for per-CPU injection.
    pub fn idle_latency_us(&self) -> u32 {
        self.idle_latency_us.load(Ordering::Acquire)
    }

    pub fn set_idle_latency_us(&self, value: u32) {
        self.idle_latency_us.store(value, Ordering::Release);
    }

    pub fn snapshot(&self) -> TunablesSnapshot {
        TunablesSnapshot {
            idle_duration_us: self.idle_duration_us(),
            window_size: self.window_size(),
            idle_latency_us: self.idle_latency_us(),
        }
    }
}
