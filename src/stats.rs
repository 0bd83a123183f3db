// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::io::Write;

use anyhow::Result;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;
use serde::Serialize;

use crate::calibration::CalibrationRow;
use crate::config::TunablesSnapshot;

pub struct Metrics {
    pub clean_samples: Counter,
    pub discarded_samples: Counter,
    pub unreadable_samples: Counter,
    pub skipped_periods: Counter,
    pub compensated_periods: Counter,
    pub pkg_cstate_ratio: Gauge,
    pub control_cpu: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            clean_samples: counter!("calibration_samples_total", "type" => "clean"),
            discarded_samples: counter!("calibration_samples_total", "type" => "discarded"),
            unreadable_samples: counter!("calibration_samples_total", "type" => "unreadable"),
            skipped_periods: counter!("skipped_periods_total"),
            compensated_periods: counter!("compensated_periods_total"),
            pkg_cstate_ratio: gauge!("pkg_cstate_ratio_pct"),
            control_cpu: gauge!("control_cpu"),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the package clamp's calibration.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CalibrationDump {
    pub control_cpu: usize,
    pub clamping: bool,
    pub target_ratio: u32,
    pub current_ratio: u32,
    pub tunables: Option<TunablesSnapshot>,
    pub rows: Vec<CalibrationRow>,
}

impl CalibrationDump {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "controlling cpu: {}", self.control_cpu)?;
        writeln!(
            w,
            "clamping={} target={} current={}",
            self.clamping, self.target_ratio, self.current_ratio
        )?;
        writeln!(w, "pct confidence steady (compensation)")?;
        for row in self.rows.iter() {
            writeln!(w, "{}\t{}\t{}", row.level, row.confidence, row.steady_comp)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
