// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One-time hardware checks done before a cooling device is created.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use log::info;

use crate::counters::CounterReader;
use crate::counters::PkgResidency;
use crate::CoolingError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub vendor: String,
    /// MONITOR/MWAIT, needed to reach deep C-states from injected idle.
    pub mwait: bool,
}

impl CpuFeatures {
    /// Parse the first processor block of /proc/cpuinfo.
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        let mut features = CpuFeatures::default();
        for line in cpuinfo.lines() {
            if line.trim().is_empty() && !features.vendor.is_empty() {
                break;
            }
            let Some((key, val)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "vendor_id" => features.vendor = val.trim().to_string(),
                "flags" => features.mwait = val.split_whitespace().any(|f| f == "monitor"),
                _ => {}
            }
        }
        features
    }

    pub fn read() -> Result<Self> {
        Self::read_from(Path::new("/proc/cpuinfo"))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::from_cpuinfo(&content))
    }

    pub fn is_intel(&self) -> bool {
        self.vendor == "GenuineIntel"
    }
}

fn unsupported(why: &str) -> anyhow::Error {
    CoolingError::UnsupportedHardware(why.to_string()).into()
}

/// Checks needed by the per-CPU cooling devices.
pub fn probe_cpu_cooling(features: &CpuFeatures) -> Result<()> {
    if !features.is_intel() || !features.mwait {
        return Err(unsupported("CPU does not support MWAIT"));
    }
    Ok(())
}

/// Checks needed by the package clamp: MWAIT and at least one package
/// C-state residency counter, as reaching package C-states is the point.
pub fn probe_package_clamp(
    features: &CpuFeatures,
    reader: &dyn CounterReader,
    cpu: usize,
) -> Result<()> {
    probe_cpu_cooling(features)?;
    if !PkgResidency::available(reader, cpu) {
        info!("No package C-state available");
        return Err(unsupported("no package C-state residency counter"));
    }
    Ok(())
}
