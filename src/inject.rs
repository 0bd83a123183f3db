// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Boundary with the idle injection primitive.
//!
//! The primitive owns the timers which park CPUs. Cooling devices register
//! the CPUs they want to clamp together with an `InjectCallbacks`
//! implementation. Around every injected idle window the primitive calls
//! `begin()` and `end()` on the CPU doing the injection. The callbacks run
//! where sleeping is not allowed, so they only touch atomics and report
//! their decision through the returned action instead of calling back into
//! the primitive.

use std::sync::Arc;

use anyhow::Result;

use crate::Cpumask;

/// Identifies one registration with the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InjectHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginAction {
    /// Go ahead with the idle window.
    Inject,
    /// Abstain from this period, the CPU keeps running.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    /// Keep the currently programmed durations.
    Keep,
    /// Use `run_us` as the run duration from the next period on.
    Reprogram { run_us: u32 },
}

pub trait InjectCallbacks: Send + Sync {
    /// Called on `cpu` right before an idle window of `idle_us`, `run_us`
    /// being the run duration currently programmed.
    fn begin(&self, _cpu: usize, _idle_us: u32, _run_us: u32) -> BeginAction {
        BeginAction::Inject
    }

    /// Called on `cpu` once the idle window is over.
    fn end(&self, cpu: usize, idle_us: u32, run_us: u32) -> EndAction;
}

/// The idle injection primitive.
pub trait IdleInjector: Send + Sync {
    /// Claim idle injection for `cpus`. Fails with
    /// `CoolingError::AlreadyClaimed` when any of them is owned already.
    fn register(
        &self,
        cpus: &Cpumask,
        callbacks: Arc<dyn InjectCallbacks>,
    ) -> Result<InjectHandle>;

    /// Program `run_us` of running followed by `idle_us` of forced idle.
    fn set_duration(&self, handle: InjectHandle, run_us: u32, idle_us: u32) -> Result<()>;

    /// Maximum exit latency the idle state may have.
    fn set_latency(&self, handle: InjectHandle, latency_us: u32) -> Result<()>;

    fn start(&self, handle: InjectHandle) -> Result<()>;

    fn stop(&self, handle: InjectHandle) -> Result<()>;

    /// Release the claim. The handle is invalid afterwards.
    fn unregister(&self, handle: InjectHandle) -> Result<()>;
}
