// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Residency sampling at injection period boundaries.
//!
//! A sampler keeps the previous snapshot of a residency counter and of the
//! reference cycle counter. Each call to `sample()` turns the deltas since
//! that snapshot into a percentage.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Result;
use log::debug;

use crate::counters::CounterId;
use crate::counters::CounterReader;
use crate::counters::PkgResidency;

/// Ratio reported for the first sample after a (re)start, before there is
/// anything to compare against.
pub const FIRST_SAMPLE_RATIO: u32 = 1;

/// What the residency counter measures.
pub enum ResidencySource {
    /// MPERF: cycles this CPU spent in C0.
    CoreActive,
    /// Sum of the package C-state residency counters.
    PackageIdle(PkgResidency),
}

impl ResidencySource {
    pub fn package() -> Self {
        ResidencySource::PackageIdle(PkgResidency::new())
    }

    fn read(&self, reader: &dyn CounterReader, cpu: usize) -> Result<u64> {
        match self {
            ResidencySource::CoreActive => reader.read(cpu, CounterId::Mperf),
            ResidencySource::PackageIdle(pkg) => pkg.read(reader, cpu),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// First sample since the last reset, only the snapshot was taken.
    Warmup,
    /// Residency over the last interval, in percent of reference cycles.
    Ratio(u32),
    /// The reference counter did not move, nothing to compute.
    Stalled,
    /// A counter could not be read. The previous snapshot is kept.
    Unreadable,
}

impl Sample {
    /// The measured ratio, with the warmup sample reported as
    /// `FIRST_SAMPLE_RATIO`.
    pub fn ratio(&self) -> Option<u32> {
        match self {
            Sample::Warmup => Some(FIRST_SAMPLE_RATIO),
            Sample::Ratio(r) => Some(*r),
            Sample::Stalled | Sample::Unreadable => None,
        }
    }
}

pub struct ResidencySampler {
    source: ResidencySource,
    last_residency: AtomicU64,
    last_reference: AtomicU64,
    /// Set once a snapshot has been taken since the last reset.
    primed: AtomicBool,
}

impl ResidencySampler {
    pub fn new(source: ResidencySource) -> Self {
        Self {
            source,
            last_residency: AtomicU64::new(0),
            last_reference: AtomicU64::new(0),
            primed: AtomicBool::new(false),
        }
    }

    /// Forget the previous snapshot. The next sample is a warmup sample.
    pub fn reset(&self) {
        self.last_residency.store(0, Ordering::Release);
        self.last_reference.store(0, Ordering::Release);
        self.primed.store(false, Ordering::Release);
    }

    pub fn sample(&self, reader: &dyn CounterReader, cpu: usize) -> Sample {
        let reference = match reader.read(cpu, CounterId::Tsc) {
            Ok(v) => v,
            Err(e) => {
                debug!("cpu {}: {:#}", cpu, e);
                return Sample::Unreadable;
            }
        };
        let residency = match self.source.read(reader, cpu) {
            Ok(v) => v,
            Err(e) => {
                debug!("cpu {}: {:#}", cpu, e);
                return Sample::Unreadable;
            }
        };

        let last_residency = self.last_residency.swap(residency, Ordering::AcqRel);
        let last_reference = self.last_reference.swap(reference, Ordering::AcqRel);

        if !self.primed.swap(true, Ordering::AcqRel) {
            return Sample::Warmup;
        }

        let d_ref = reference.wrapping_sub(last_reference);
        if d_ref == 0 {
            return Sample::Stalled;
        }
        let d_res = residency.wrapping_sub(last_residency);

        Sample::Ratio(residency_ratio(d_res, d_ref))
    }
}

/// `100 * d_residency / d_reference`, capped at 100.
pub fn residency_ratio(d_residency: u64, d_reference: u64) -> u32 {
    if d_reference == 0 {
        return 0;
    }
    let ratio = (d_residency as u128) * 100 / (d_reference as u128);
    ratio.min(100) as u32
}
