// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Idle injection cooling devices
//!
//! Thermal mitigation by forcing CPUs idle for part of every period. Idle
//! injection trades throughput for power without touching frequency or
//! voltage: the CPUs run for `run` microseconds and are then parked for
//! `idle` microseconds, the ratio between the two being picked from the
//! throttling level a thermal governor requests.
//!
//! Two cooling devices are provided.
//!
//! ## Per-CPU devices
//!
//! `CpuCoolingRegistry` holds one `CpuIdleCooling` per online CPU, each with
//! its own level. The achieved idle ratio of a CPU is derived from its
//! MPERF and TSC counters and the run duration is stretched when the CPU
//! keeps falling short of the target.
//!
//! ## Package clamp
//!
//! `PowerClamp` applies one target to the whole package so that idle windows
//! overlap and the package reaches deep C-states. An elected control CPU
//! measures the package C-state residency and learns, level by level, how
//! much extra idle the platform needs to actually hit the target.
//!
//! Both devices talk to the hardware through a `CounterReader` and to the
//! injection timers through an `IdleInjector`, so they can run against the
//! in-process simulation in `sim` as well as against real MSRs.

pub mod calibration;
pub mod config;
pub mod counters;
pub mod duty_cycle;
pub mod hysteresis;
pub mod inject;
pub mod percpu;
pub mod powerclamp;
pub mod probe;
pub mod sampler;
pub mod sim;
pub mod stats;

mod cooling;
pub use cooling::CoolingDevice;

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

mod error;
pub use error::cooling_error;
pub use error::CoolingError;

mod topology;
pub use topology::current_cpu;
pub use topology::Topology;
pub use topology::BOOT_CPU;

pub use counters::CounterId;
pub use counters::CounterReader;
pub use percpu::CpuCoolingRegistry;
pub use percpu::CpuIdleCooling;
pub use powerclamp::PowerClamp;
